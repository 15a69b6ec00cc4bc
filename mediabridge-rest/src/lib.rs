pub mod errors;
pub mod range;
pub mod routes;
pub mod settings;

use std::io;
use std::sync::Arc;

use actix_web::{middleware, web::Data, App, HttpServer};
use mediabridge::{Fetcher, MediaApi, MediaResolver};
use mediabridge_cache::BinaryCache;

use settings::Settings;

pub(crate) type AppResult<T> = Result<T, errors::AppError>;

/// Knobs the media route needs besides its collaborators.
#[derive(Debug, Clone)]
pub struct MediaOptions {
    pub hash_length: usize,
    /// Objects larger than this get the preroll treatment.
    pub video_preroll_threshold: u64,
    /// How much of a large video to serve when no range was asked for.
    pub video_preroll_bytes: u64,
}

/// Shared state handed to every request handler.
pub struct AppContext {
    pub resolver: Arc<dyn MediaResolver>,
    pub fetcher: Arc<Fetcher>,
    pub options: MediaOptions,
}

impl std::fmt::Debug for AppContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppContext")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Open the cache, wire the fetcher and run the HTTP server until it
/// shuts down, flushing the cache on the way out.
///
/// The two collaborators come from the embedding platform client: `api`
/// talks to the upstream media endpoint, `resolver` maps message ids to
/// documents.
///
/// # Errors
///
/// Binding errors, cache open/close errors (wrapped as I/O errors) and
/// anything the server loop returns.
pub async fn serve(
    settings: Settings,
    api: Arc<dyn MediaApi>,
    resolver: Arc<dyn MediaResolver>,
) -> io::Result<()> {
    let cache = Arc::new(
        BinaryCache::open(settings.cache_config())
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?,
    );

    let fetcher = Arc::new(Fetcher::new(api, cache.clone(), settings.fetch_config()));

    let ctx = Data::new(AppContext {
        resolver,
        fetcher,
        options: settings.media_options(),
    });

    let addr = settings.socket_addr();
    tracing::info!(%addr, "binding");

    HttpServer::new(move || {
        App::new()
            .app_data(ctx.clone())
            .wrap(middleware::NormalizePath::trim())
            .wrap(middleware::Logger::default())
            .configure(routes::config)
    })
    .bind(addr)?
    .run()
    .await?;

    cache
        .close()
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
}
