//! Static front end with client-side routing
//!
//! Extensionless GET paths are answered with the entry document so the
//! browser application can route them itself. Anything that looks like a
//! file is served from the static directory or not at all.

use std::path::PathBuf;

use warp::filters::path::FullPath;
use warp::reply::Response;
use warp::{Filter, Rejection, Reply};

/// True when the last path segment has no file extension
pub fn is_client_route(path: &str) -> bool {
    let last = path.rsplit('/').next().unwrap_or_default();
    !last.contains('.')
}

async fn only_client_routes(path: FullPath) -> Result<(), Rejection> {
    if is_client_route(path.as_str()) {
        Ok(())
    } else {
        Err(warp::reject::not_found())
    }
}

/// Entry document for client routes, static assets for everything else
pub fn routes(
    static_dir: PathBuf,
    index: PathBuf,
) -> impl Filter<Extract = (Response,), Error = Rejection> + Clone {
    let entry = warp::get()
        .and(warp::path::full())
        .and_then(only_client_routes)
        .untuple_one()
        .and(warp::fs::file(index))
        .map(|file: warp::fs::File| file.into_response());

    let assets = warp::get()
        .and(warp::fs::dir(static_dir))
        .map(|file: warp::fs::File| file.into_response());

    entry.or(assets).unify()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use warp::http::StatusCode;

    #[test]
    fn test_client_route_detection() {
        assert!(is_client_route("/"));
        assert!(is_client_route("/menu"));
        assert!(is_client_route("/orders/42"));
        assert!(is_client_route("/v1.2/orders"));
        assert!(!is_client_route("/app.js"));
        assert!(!is_client_route("/assets/logo.png"));
    }

    #[tokio::test]
    async fn test_forward_and_assets() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("index.html"), "<html>entry</html>").unwrap();
        fs::write(dir.path().join("app.js"), "console.log('pos')").unwrap();

        let filter = routes(dir.path().to_path_buf(), dir.path().join("index.html"));

        let menu = warp::test::request().path("/menu").reply(&filter).await;
        assert_eq!(menu.status(), StatusCode::OK);
        assert_eq!(menu.body(), "<html>entry</html>");

        let script = warp::test::request().path("/app.js").reply(&filter).await;
        assert_eq!(script.status(), StatusCode::OK);
        assert_eq!(script.body(), "console.log('pos')");

        let missing = warp::test::request().path("/missing.css").reply(&filter).await;
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }
}
