pub mod media;

use actix_web::web::{self, ServiceConfig};

pub fn config(cfg: &mut ServiceConfig) {
    cfg.service(
        web::resource("/{message_id}/{hash}")
            .route(web::get().to(media::get))
            .route(web::head().to(media::head)),
    );
}
