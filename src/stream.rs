//! HTTP surface: index page and the multipart MJPEG preview stream
//!
//! Every accepted connection runs as its own task under `axum::serve`. A
//! stream viewer holds a [`PreviewSubscriber`]; when the client goes away
//! hyper drops the response body, which drops the subscriber and ends that
//! viewer without touching anyone else.

use std::convert::Infallible;
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use bytes::{BufMut, Bytes, BytesMut};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::pipeline::slot::{PreviewFrame, PreviewSlot, PreviewSubscriber};

/// Multipart boundary token.
pub const BOUNDARY: &str = "FRAME";

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct StreamState {
    slot: Arc<PreviewSlot>,
    page: Bytes,
}

impl StreamState {
    pub fn new(slot: Arc<PreviewSlot>, preview_width: u32, preview_height: u32) -> Self {
        Self {
            slot,
            page: Bytes::from(index_page(preview_width, preview_height)),
        }
    }
}

/// The static index page sized to the preview resolution.
pub fn index_page(width: u32, height: u32) -> String {
    format!(
        "<!DOCTYPE html>\n\
         <html>\n\
         <head>\n\
         <title>clipcam live preview</title>\n\
         </head>\n\
         <body>\n\
         <h1>Stream:</h1>\n\
         <img src=\"stream.mjpg\" width=\"{width}\" height=\"{height}\" alt=\"Streaming Image\">\n\
         </body>\n\
         </html>\n"
    )
}

/// Build the router with the three fixed endpoints; anything else is 404.
pub fn router(state: StreamState) -> Router {
    Router::new()
        .route("/", get(redirect_to_index))
        .route("/index.html", get(index))
        .route("/stream.mjpg", get(stream))
        .fallback(not_found)
        .with_state(state)
}

async fn redirect_to_index() -> Response {
    (
        StatusCode::MOVED_PERMANENTLY,
        [(header::LOCATION, "/index.html")],
    )
        .into_response()
}

async fn index(State(state): State<StreamState>) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/html")],
        state.page.clone(),
    )
        .into_response()
}

async fn not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}

async fn stream(
    State(state): State<StreamState>,
    peer: Option<ConnectInfo<SocketAddr>>,
) -> Response {
    let client = peer.map(|ConnectInfo(addr)| addr.to_string());
    let viewer = Viewer::new(state.slot.subscribe(), client);

    let body = futures::stream::unfold(viewer, |mut viewer| async move {
        let frame = viewer.subscriber.next_frame().await?;
        Some((Ok::<_, Infallible>(multipart_chunk(&frame)), viewer))
    });

    let mut response = Response::new(Body::from_stream(body));
    let headers = response.headers_mut();
    headers.insert(header::AGE, HeaderValue::from_static("0"));
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, private"),
    );
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("multipart/x-mixed-replace; boundary=FRAME"),
    );
    response
}

/// Encode one frame as a multipart part: boundary, part headers, JPEG, CRLF.
pub fn multipart_chunk(frame: &PreviewFrame) -> Bytes {
    let header = format!(
        "--{BOUNDARY}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        frame.jpeg.len()
    );
    let mut chunk = BytesMut::with_capacity(header.len() + frame.jpeg.len() + 2);
    chunk.put_slice(header.as_bytes());
    chunk.put_slice(&frame.jpeg);
    chunk.put_slice(b"\r\n");
    chunk.freeze()
}

/// One connected viewer. Leaving is logged when the body is dropped.
struct Viewer {
    subscriber: PreviewSubscriber,
    client: String,
}

impl Viewer {
    fn new(subscriber: PreviewSubscriber, client: Option<String>) -> Self {
        let client = client.unwrap_or_else(|| "unknown".into());
        info!(client = %client, "Added streaming client");
        metrics::gauge!("clipcam_stream_clients").increment(1.0);
        Self { subscriber, client }
    }
}

impl Drop for Viewer {
    fn drop(&mut self) {
        metrics::gauge!("clipcam_stream_clients").decrement(1.0);
        warn!(client = %self.client, "Removed streaming client");
    }
}

/// Default time open connections get to finish after shutdown starts.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Bound HTTP listener serving the preview.
pub struct StreamBroadcaster {
    listener: TcpListener,
    state: StreamState,
    grace: Duration,
}

impl StreamBroadcaster {
    pub async fn bind(addr: SocketAddr, state: StreamState) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::config(format!("Failed to bind {addr}: {e}")))?;
        Ok(Self {
            listener,
            state,
            grace: SHUTDOWN_GRACE,
        })
    }

    /// Bound how long viewers may drain once `cancel` fires.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until `cancel` fires and open streams have ended, or the
    /// shutdown grace runs out.
    ///
    /// A viewer that stops reading leaves hyper waiting to flush its socket;
    /// once the grace expires the server is dropped without it.
    pub async fn serve(self, cancel: CancellationToken) -> Result<()> {
        let addr = self.local_addr()?;
        info!("Streaming on http://{}/index.html", addr);

        let Self {
            listener,
            state,
            grace,
        } = self;
        let app = router(state).into_make_service_with_connect_info::<SocketAddr>();
        let server = axum::serve(listener, app)
            .with_graceful_shutdown(cancel.clone().cancelled_owned())
            .into_future();
        tokio::pin!(server);

        tokio::select! {
            served = &mut server => served?,
            _ = cancel.cancelled() => {
                match tokio::time::timeout(grace, &mut server).await {
                    Ok(served) => served?,
                    Err(_) => warn!(
                        grace_ms = grace.as_millis() as u64,
                        "Viewers did not drain in time, abandoning their connections"
                    ),
                }
            }
        }

        info!("HTTP server stopped");
        Ok(())
    }
}
