use axum::Router;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Port the network-boot tests expect the host to serve files on.
pub const DEFAULT_PORT: u16 = 60123;

/// Configuration for the auxiliary HTTP server
#[derive(Debug, Clone)]
pub struct HttpServerConfig {
    /// Address to bind to
    pub bind_address: IpAddr,
    /// Port to bind to, 0 for any free port
    pub port: u16,
    /// Directory served at `/`
    pub root: PathBuf,
}

impl Default for HttpServerConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            root: PathBuf::from("."),
        }
    }
}

/// A running static file server. Dropping the handle does not stop it; call
/// [`HttpServer::stop`].
pub struct HttpServer {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl HttpServer {
    /// Binds the listening socket and starts serving on a background task.
    ///
    /// The socket uses SO_REUSEADDR, so the port can be bound again while old
    /// connections are still in TIME_WAIT.
    pub fn start(config: HttpServerConfig) -> io::Result<Self> {
        let listener = bind_listener(SocketAddr::new(config.bind_address, config.port))?;
        let local_addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();

        info!("Serving {} over HTTP on {}", config.root.display(), local_addr);
        let app = router(config.root);
        let signal = shutdown.clone().cancelled_owned();
        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(signal)
                .await
            {
                warn!("HTTP server error: {}", e);
            }
        });

        Ok(Self {
            local_addr,
            shutdown,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting, lets open requests finish and waits until the
    /// listener is closed.
    pub async fn stop(self) {
        self.shutdown.cancel();
        if let Err(e) = self.task.await {
            warn!("HTTP server task ended abnormally: {}", e);
        }
        info!("HTTP server on {} stopped", self.local_addr);
    }
}

/// GET/HEAD for files under `root`; directories serve their `index.html`.
fn router(root: PathBuf) -> Router {
    Router::new()
        .fallback_service(ServeDir::new(root))
        .layer(TraceLayer::new_for_http())
}

fn bind_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(128)?;
    socket.set_nonblocking(true)?;
    TcpListener::from_std(socket.into())
}
