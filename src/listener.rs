//! Unix socket listener with the phony-file hand-off.
//!
//! The platform only connects once the socket at the configured path exists.
//! To never expose a half set up socket, the listener binds a sibling
//! `phony<name>`, opens up its permissions, and then symlinks `<name>` to it.

use crate::config::{strip_scheme, Config};
use crate::dispatch::Dispatcher;
use crate::handler::Handler;
use crate::Error;
use async_std::os::unix::net::{UnixListener, UnixStream};
use futures_util::future::{self, poll_fn, BoxFuture};
use futures_util::stream::{FuturesUnordered, Stream, StreamExt};
use std::fmt;
use std::future::Future;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::task::Poll;
use std::time::Duration;

/// How long in-flight connections get to finish after shutdown.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Permissions of the bound socket, the platform runs as another user.
const SOCKET_MODE: u32 = 0o666;

/// The two filesystem entries making up the listening socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketPaths {
    /// Path the platform connects to, a symlink once bound.
    pub socket: PathBuf,
    /// Path actually bound.
    pub phony: PathBuf,
}

impl SocketPaths {
    /// Derive both paths from a listener address, `unix:` scheme optional.
    pub fn from_addr(addr: &str) -> Result<Self, Error> {
        let socket = PathBuf::from(strip_scheme(addr));

        let file_name = match socket.file_name() {
            Some(f) if !addr.ends_with('/') => f.to_string_lossy().into_owned(),
            _ => return Err(Error::Config(format!("Listener has no file name: {:?}", addr))),
        };

        let dir = socket.parent().unwrap_or_else(|| Path::new(""));
        let phony = dir.join(format!("phony{}", file_name));

        Ok(SocketPaths { socket, phony })
    }

    /// Name of the phony file, the target of the symlink.
    fn phony_name(&self) -> PathBuf {
        self.phony
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| self.phony.clone())
    }
}

/// Bound listening socket.
pub struct Listener {
    listener: UnixListener,
    paths: SocketPaths,
}

impl Listener {
    /// Bind the socket configured in `FN_LISTENER`.
    pub async fn bind(config: &Config) -> Result<Self, Error> {
        Listener::bind_addr(config.listener()).await
    }

    /// Bind `addr`, replacing leftovers of an earlier run.
    pub async fn bind_addr(addr: &str) -> Result<Self, Error> {
        let paths = SocketPaths::from_addr(addr)?;

        remove_stale(&paths.socket);
        remove_stale(&paths.phony);

        match bind_phony(&paths) {
            Ok(listener) => {
                info!(
                    "Listening on {} ({})",
                    paths.socket.display(),
                    paths.phony.display()
                );
                Ok(Listener { listener, paths })
            }
            Err(e) => {
                remove_stale(&paths.socket);
                remove_stale(&paths.phony);
                Err(e.into())
            }
        }
    }

    pub fn paths(&self) -> &SocketPaths {
        &self.paths
    }

    /// Accept connections and serve them until `shutdown` completes.
    ///
    /// At most `max_connections` connections are served at once, beyond that
    /// new connections wait in the socket backlog. After shutdown no new
    /// connection is accepted and the ones in flight get [`SHUTDOWN_GRACE`]
    /// to finish. The socket files are removed before returning.
    pub async fn serve<H, F>(self, dispatcher: Dispatcher<H>, shutdown: F) -> Result<(), Error>
    where
        H: Handler,
        F: Future<Output = ()>,
    {
        let max = dispatcher.config().max_connections();

        let mut shutdown = Box::pin(shutdown);
        let mut incoming = Box::pin(self.listener.incoming());
        let mut in_flight: FuturesUnordered<BoxFuture<'static, ()>> = FuturesUnordered::new();

        loop {
            let event = poll_fn(|cx| {
                if shutdown.as_mut().poll(cx).is_ready() {
                    return Poll::Ready(Event::Shutdown);
                }

                // drive connections, finished ones just drop out.
                while let Poll::Ready(Some(())) = in_flight.poll_next_unpin(cx) {}

                if in_flight.len() < max {
                    if let Poll::Ready(next) = incoming.as_mut().poll_next(cx) {
                        return Poll::Ready(Event::Accept(next));
                    }
                }

                Poll::Pending
            })
            .await;

            match event {
                Event::Shutdown => break,
                Event::Accept(None) => {
                    warn!("Listener stopped accepting");
                    break;
                }
                Event::Accept(Some(Err(e))) => {
                    warn!("Accept failed: {}", e);
                }
                Event::Accept(Some(Ok(stream))) => {
                    trace!("Accepted connection, {} in flight", in_flight.len());
                    in_flight.push(connection(dispatcher.clone(), stream));
                }
            }
        }

        info!("Shutting down, {} connections in flight", in_flight.len());

        let drain = async { while in_flight.next().await.is_some() {} };
        if async_std::future::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
            warn!("Abandoning connections still in flight after {:?}", SHUTDOWN_GRACE);
        }

        drop(incoming);
        drop(self);

        Ok(())
    }
}

enum Event {
    Shutdown,
    Accept(Option<io::Result<UnixStream>>),
}

fn connection<H: Handler>(dispatcher: Dispatcher<H>, stream: UnixStream) -> BoxFuture<'static, ()> {
    Box::pin(async move {
        if let Err(e) = dispatcher.serve_connection(stream).await {
            debug!("Connection ended: {}", e);
        }
    })
}

fn bind_phony(paths: &SocketPaths) -> io::Result<UnixListener> {
    let listener = std::os::unix::net::UnixListener::bind(&paths.phony)?;

    std::fs::set_permissions(&paths.phony, std::fs::Permissions::from_mode(SOCKET_MODE))?;

    // relative target, the pair can be moved together.
    std::os::unix::fs::symlink(paths.phony_name(), &paths.socket)?;

    Ok(UnixListener::from(listener))
}

fn remove_stale(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!("Removed {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => debug!("Failed to remove {}: {}", path.display(), e),
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        remove_stale(&self.paths.socket);
        remove_stale(&self.paths.phony);
    }
}

/// Bind the configured listener and serve `handler` until the process ends.
pub async fn run<H: Handler>(config: Config, handler: H) -> Result<(), Error> {
    let listener = Listener::bind(&config).await?;
    listener
        .serve(Dispatcher::new(config, handler), future::pending())
        .await
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener").field("paths", &self.paths).finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn phony_next_to_socket() {
        let p = SocketPaths::from_addr("unix:/tmp/iofs/lsnr.sock").unwrap();
        assert_eq!(p.socket, PathBuf::from("/tmp/iofs/lsnr.sock"));
        assert_eq!(p.phony, PathBuf::from("/tmp/iofs/phonylsnr.sock"));
        assert_eq!(p.phony_name(), PathBuf::from("phonylsnr.sock"));
    }

    #[test]
    fn relative_socket() {
        let p = SocketPaths::from_addr("fn.sock").unwrap();
        assert_eq!(p.phony, PathBuf::from("phonyfn.sock"));
    }

    #[test]
    fn no_file_name() {
        assert!(SocketPaths::from_addr("unix:/tmp/").is_err());
        assert!(SocketPaths::from_addr("unix:").is_err());
    }
}
