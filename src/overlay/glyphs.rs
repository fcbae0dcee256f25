//! 5x7 bitmap glyphs for the characters a timestamp needs

pub const GLYPH_WIDTH: u32 = 5;
pub const GLYPH_HEIGHT: u32 = 7;
/// Horizontal advance in glyph dots, including one dot of spacing.
pub const GLYPH_ADVANCE: u32 = GLYPH_WIDTH + 1;

type Glyph = [u8; GLYPH_HEIGHT as usize];

const BLANK: Glyph = [0; 7];

const DIGITS: [Glyph; 10] = [
    [0x0E, 0x11, 0x13, 0x15, 0x19, 0x11, 0x0E],
    [0x04, 0x0C, 0x04, 0x04, 0x04, 0x04, 0x0E],
    [0x0E, 0x11, 0x01, 0x02, 0x04, 0x08, 0x1F],
    [0x1F, 0x02, 0x04, 0x02, 0x01, 0x11, 0x0E],
    [0x02, 0x06, 0x0A, 0x12, 0x1F, 0x02, 0x02],
    [0x1F, 0x10, 0x1E, 0x01, 0x01, 0x11, 0x0E],
    [0x06, 0x08, 0x10, 0x1E, 0x11, 0x11, 0x0E],
    [0x1F, 0x01, 0x02, 0x04, 0x08, 0x08, 0x08],
    [0x0E, 0x11, 0x11, 0x0E, 0x11, 0x11, 0x0E],
    [0x0E, 0x11, 0x11, 0x0F, 0x01, 0x02, 0x0C],
];

const DOT: Glyph = [0x00, 0x00, 0x00, 0x00, 0x00, 0x0C, 0x0C];
const COLON: Glyph = [0x00, 0x0C, 0x0C, 0x00, 0x0C, 0x0C, 0x00];
const DASH: Glyph = [0x00, 0x00, 0x00, 0x1F, 0x00, 0x00, 0x00];
const SLASH: Glyph = [0x01, 0x01, 0x02, 0x04, 0x08, 0x10, 0x10];

/// Bitmap rows for `ch`, most significant of the low five bits leftmost.
/// Characters without a glyph render blank.
pub fn glyph(ch: u8) -> &'static Glyph {
    match ch {
        b'0'..=b'9' => &DIGITS[(ch - b'0') as usize],
        b'.' => &DOT,
        b':' => &COLON,
        b'-' => &DASH,
        b'/' => &SLASH,
        _ => &BLANK,
    }
}

/// Iterate the lit dots of a glyph as `(column, row)`.
pub fn lit_dots(glyph: &Glyph) -> impl Iterator<Item = (u32, u32)> + '_ {
    glyph.iter().enumerate().flat_map(|(row, bits)| {
        (0..GLYPH_WIDTH)
            .filter(move |col| bits & (1 << (GLYPH_WIDTH - 1 - col)) != 0)
            .map(move |col| (col, row as u32))
    })
}
