use actix_web::{
    http::{header, StatusCode},
    web::{Data, Path},
    HttpRequest, HttpResponse, HttpResponseBuilder,
};
use futures_util::StreamExt;
use mediabridge::{location::DocumentFile, stream_range};
use tracing::debug;

use crate::{
    errors::{log_body_error, AppError},
    range::{parse_range, RangeError, RequestedRange},
    AppContext, AppResult,
};

/// How the response interval was decided.
#[derive(Debug, Clone, Copy)]
enum Plan {
    Full,
    Partial(RequestedRange),
}

async fn resolve_and_plan(
    req: &HttpRequest,
    ctx: &AppContext,
    message_id: &str,
    hash: &str,
) -> AppResult<(DocumentFile, Plan)> {
    let message_id: i64 = message_id.parse().map_err(|_| AppError::BadRequest)?;

    let file = ctx.resolver.resolve(message_id).await.map_err(AppError::from)?;

    if hash != file.url_hash(ctx.options.hash_length) {
        return Err(AppError::InvalidHash);
    }

    let range_header = match req.headers().get(header::RANGE) {
        Some(value) => Some(value.to_str().map_err(|_| AppError::BadRequest)?),
        None => None,
    };

    let plan = match range_header {
        Some(value) => {
            let range = parse_range(value, file.size).map_err(|e| match e {
                RangeError::Malformed => AppError::BadRequest,
                RangeError::Unsatisfiable => AppError::RangeNotSatisfiable,
            })?;
            Plan::Partial(range)
        }
        None => {
            // Large videos get a short preroll instead of the whole
            // object, which makes players seek with explicit ranges.
            if file.size > ctx.options.video_preroll_threshold
                && file.mime_type.type_() == mime::VIDEO
            {
                let end = (ctx.options.video_preroll_bytes - 1).min(file.size - 1);
                debug!(size = file.size, end, "applying video preroll");
                Plan::Partial(RequestedRange { start: 0, end })
            } else {
                Plan::Full
            }
        }
    };

    Ok((file, plan))
}

fn response_head(file: &DocumentFile, plan: Plan) -> HttpResponseBuilder {
    let status = match plan {
        Plan::Full => StatusCode::OK,
        Plan::Partial(_) => StatusCode::PARTIAL_CONTENT,
    };

    let mut res = HttpResponseBuilder::new(status);

    res.insert_header((header::ACCEPT_RANGES, "bytes"))
        .insert_header((header::CONTENT_TYPE, file.mime_type.to_string()))
        .insert_header((
            header::CONTENT_DISPOSITION,
            format!("inline; filename=\"{}\"", file.file_name),
        ));

    if let Plan::Partial(range) = plan {
        res.insert_header((
            header::CONTENT_RANGE,
            format!("bytes {}-{}/{}", range.start, range.end, file.size),
        ));
    }

    res
}

fn body_len(file: &DocumentFile, plan: Plan) -> u64 {
    match plan {
        Plan::Full => file.size,
        Plan::Partial(range) => range.end - range.start + 1,
    }
}

pub async fn get(
    req: HttpRequest,
    ctx: Data<AppContext>,
    path: Path<(String, String)>,
) -> AppResult<HttpResponse> {
    let (message_id, hash) = path.into_inner();
    let (file, plan) = resolve_and_plan(&req, &ctx, &message_id, &hash).await?;

    let mut res = response_head(&file, plan);

    if file.size == 0 {
        return Ok(res.no_chunking(0).finish());
    }

    let (start, end) = match plan {
        Plan::Full => (0, file.size - 1),
        Plan::Partial(range) => (range.start, range.end),
    };

    let stream = stream_range(
        ctx.fetcher.clone(),
        file.location.clone(),
        start,
        end,
        file.size,
    )
    .map(|item| {
        // Headers are long gone by the time a chunk fails; classify and
        // log here, then let the connection drop.
        item.map_err(|e| {
            log_body_error(&e);
            e
        })
    });

    res.no_chunking(end - start + 1);

    Ok(res.streaming(Box::pin(stream)))
}

pub async fn head(
    req: HttpRequest,
    ctx: Data<AppContext>,
    path: Path<(String, String)>,
) -> AppResult<HttpResponse> {
    let (message_id, hash) = path.into_inner();
    let (file, plan) = resolve_and_plan(&req, &ctx, &message_id, &hash).await?;

    let mut res = response_head(&file, plan);

    Ok(res.no_chunking(body_len(&file, plan)).finish())
}
