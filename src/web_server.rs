use crate::config::AppConfig;
use crate::error::AppError;
use crate::indexer::Indexer;
use crate::query::{FolderQuery, SortKey, SortOrder, DEFAULT_PAGE_SIZE};
use actix_web::{web, App, HttpResponse, HttpServer};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;

/// Runs a blocking engine call off the async runtime.
async fn blocking<T, F>(indexer: web::Data<Indexer>, job: F) -> Result<T, AppError>
where
    F: FnOnce(&Indexer) -> Result<T, AppError> + Send + 'static,
    T: Send + 'static,
{
    let indexer = indexer.into_inner();
    tokio::task::spawn_blocking(move || job(&indexer)).await?
}

#[derive(Debug, Deserialize)]
struct ScanParams {
    #[serde(default)]
    full: bool,
    #[serde(default)]
    recursive: bool,
}

/// Query string of the folder listing; `tags` is comma separated.
#[derive(Debug, Deserialize)]
struct ListParams {
    q: Option<String>,
    tags: Option<String>,
    #[serde(default)]
    sort: SortKey,
    #[serde(default)]
    order: SortOrder,
    offset: Option<u32>,
    limit: Option<u32>,
}

impl From<ListParams> for FolderQuery {
    fn from(params: ListParams) -> Self {
        FolderQuery {
            q: params.q,
            tags: params
                .tags
                .map(|t| {
                    t.split(',')
                        .map(str::trim)
                        .filter(|t| !t.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            sort: params.sort,
            order: params.order,
            offset: params.offset.unwrap_or(0),
            limit: params.limit.unwrap_or(DEFAULT_PAGE_SIZE),
        }
    }
}

#[derive(Debug, Deserialize)]
struct PathParam {
    path: String,
}

#[derive(Debug, Deserialize)]
struct OptionalPath {
    path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PreviewBody {
    path: String,
    file: String,
}

#[derive(Debug, Deserialize)]
struct RatingBody {
    path: String,
    rating: u8,
}

#[derive(Debug, Deserialize)]
struct TagBody {
    path: String,
    tag: String,
}

#[derive(Debug, Deserialize)]
struct RenameBody {
    path: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct CatalogParams {
    #[serde(default)]
    incremental: bool,
}

async fn scan(
    indexer: web::Data<Indexer>,
    params: web::Query<ScanParams>,
) -> Result<HttpResponse, AppError> {
    let ScanParams { full, recursive } = params.into_inner();
    log::debug!("Scan requested (full: {}, recursive: {})", full, recursive);

    if full {
        let stats = blocking(indexer, move |ix| ix.full_reindex(recursive)).await?;
        Ok(HttpResponse::Ok().json(stats))
    } else {
        let stats = blocking(indexer, |ix| ix.incremental_reindex()).await?;
        Ok(HttpResponse::Ok().json(stats))
    }
}

async fn list_folders(
    indexer: web::Data<Indexer>,
    params: web::Query<ListParams>,
) -> Result<HttpResponse, AppError> {
    let request = FolderQuery::from(params.into_inner());
    log::debug!("Folder listing: {:?}", request);
    let page = blocking(indexer, move |ix| ix.query(&request)).await?;
    Ok(HttpResponse::Ok().json(page))
}

async fn folder_detail(
    indexer: web::Data<Indexer>,
    params: web::Query<PathParam>,
) -> Result<HttpResponse, AppError> {
    let path = params.into_inner().path;
    let record = blocking(indexer, move |ix| ix.get_folder(&path)).await?;
    Ok(HttpResponse::Ok().json(record))
}

async fn rebuild_folder(
    indexer: web::Data<Indexer>,
    body: web::Json<PathParam>,
) -> Result<HttpResponse, AppError> {
    let path = PathBuf::from(body.into_inner().path);
    let record = blocking(indexer, move |ix| ix.rebuild_folder(&path)).await?;
    Ok(HttpResponse::Ok().json(record))
}

async fn set_preview(
    indexer: web::Data<Indexer>,
    body: web::Json<PreviewBody>,
) -> Result<HttpResponse, AppError> {
    let PreviewBody { path, file } = body.into_inner();
    let record = blocking(indexer, move |ix| {
        ix.set_preview(&PathBuf::from(path), &PathBuf::from(file))
    })
    .await?;
    Ok(HttpResponse::Ok().json(record))
}

async fn set_rating(
    indexer: web::Data<Indexer>,
    body: web::Json<RatingBody>,
) -> Result<HttpResponse, AppError> {
    let RatingBody { path, rating } = body.into_inner();
    let record = blocking(indexer, move |ix| ix.set_rating(&PathBuf::from(path), rating)).await?;
    Ok(HttpResponse::Ok().json(record))
}

async fn add_tag(
    indexer: web::Data<Indexer>,
    body: web::Json<TagBody>,
) -> Result<HttpResponse, AppError> {
    let TagBody { path, tag } = body.into_inner();
    let record = blocking(indexer, move |ix| ix.add_tag(&PathBuf::from(path), &tag)).await?;
    Ok(HttpResponse::Ok().json(record))
}

async fn remove_tag(
    indexer: web::Data<Indexer>,
    body: web::Json<TagBody>,
) -> Result<HttpResponse, AppError> {
    let TagBody { path, tag } = body.into_inner();
    let record = blocking(indexer, move |ix| ix.remove_tag(&PathBuf::from(path), &tag)).await?;
    Ok(HttpResponse::Ok().json(record))
}

async fn rename_folder(
    indexer: web::Data<Indexer>,
    body: web::Json<RenameBody>,
) -> Result<HttpResponse, AppError> {
    let RenameBody { path, name } = body.into_inner();
    let record = blocking(indexer, move |ix| ix.rename_folder(&PathBuf::from(path), &name)).await?;
    Ok(HttpResponse::Ok().json(record))
}

async fn delete_file(
    indexer: web::Data<Indexer>,
    params: web::Query<PathParam>,
) -> Result<HttpResponse, AppError> {
    let path = PathBuf::from(params.into_inner().path);
    let record = blocking(indexer, move |ix| ix.delete_file(&path)).await?;
    Ok(HttpResponse::Ok().json(record))
}

async fn delete_project(
    indexer: web::Data<Indexer>,
    params: web::Query<PathParam>,
) -> Result<HttpResponse, AppError> {
    let path = PathBuf::from(params.into_inner().path);
    blocking(indexer, move |ix| ix.delete_project(&path)).await?;
    Ok(HttpResponse::NoContent().finish())
}

async fn list_tags(indexer: web::Data<Indexer>) -> Result<HttpResponse, AppError> {
    let tags = blocking(indexer, |ix| ix.list_tags()).await?;
    Ok(HttpResponse::Ok().json(tags))
}

async fn rebuild_tags(
    indexer: web::Data<Indexer>,
    params: web::Query<CatalogParams>,
) -> Result<HttpResponse, AppError> {
    let incremental = params.into_inner().incremental;
    let count = blocking(indexer, move |ix| {
        if incremental {
            ix.add_missing_catalog_tags()
        } else {
            ix.rebuild_tag_catalog()
        }
    })
    .await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({ "tags": count })))
}

async fn repair_tags(
    indexer: web::Data<Indexer>,
    body: Option<web::Json<OptionalPath>>,
) -> Result<HttpResponse, AppError> {
    let path = body.and_then(|b| b.into_inner().path).map(PathBuf::from);
    let stats = blocking(indexer, move |ix| match path {
        Some(path) => ix.repair_tags_at(&path),
        None => ix.repair_all_tags(),
    })
    .await?;
    Ok(HttpResponse::Ok().json(stats))
}

pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/api/scan").route(web::post().to(scan)))
        .service(
            web::resource("/api/folders")
                .route(web::get().to(list_folders))
                .route(web::delete().to(delete_project)),
        )
        .service(web::resource("/api/folders/detail").route(web::get().to(folder_detail)))
        .service(web::resource("/api/folders/rebuild").route(web::post().to(rebuild_folder)))
        .service(web::resource("/api/folders/preview").route(web::post().to(set_preview)))
        .service(web::resource("/api/folders/rating").route(web::post().to(set_rating)))
        .service(
            web::resource("/api/folders/tags")
                .route(web::post().to(add_tag))
                .route(web::delete().to(remove_tag)),
        )
        .service(web::resource("/api/folders/rename").route(web::post().to(rename_folder)))
        .service(web::resource("/api/files").route(web::delete().to(delete_file)))
        .service(web::resource("/api/tags").route(web::get().to(list_tags)))
        .service(web::resource("/api/tags/rebuild").route(web::post().to(rebuild_tags)))
        .service(web::resource("/api/tags/repair").route(web::post().to(repair_tags)));
}

pub async fn start_web_server(config: Arc<AppConfig>, indexer: Arc<Indexer>) -> std::io::Result<()> {
    let port = config.web_port;
    let indexer_data = web::Data::from(indexer);

    log::info!("Starting web server on port: {}", port);

    HttpServer::new(move || {
        App::new()
            .app_data(indexer_data.clone())
            .configure(routes)
    })
    .bind(format!("0.0.0.0:{}", port))?
    .run()
    .await
}
