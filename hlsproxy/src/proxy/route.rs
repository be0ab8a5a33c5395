use hyper::Method;

const MANIFEST_EXTENSIONS: &[&str] = &["m3u8"];
const SEGMENT_EXTENSIONS: &[&str] = &["ts", "m4s", "mp4", "m4a", "m4v", "aac"];

/// How the proxy treats a request, decided by the extension of the last path component
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// playlist requests, whose responses are inspected and rewritten
    Manifest,
    /// media segment requests, which are subject to the active policy
    Segment,
    /// everything else is forwarded as-is
    Default,
}

impl Route {
    pub fn classify(method: &Method, path: &str) -> Route {
        if method != Method::GET {
            return Route::Default;
        }
        if has_extension(path, MANIFEST_EXTENSIONS) {
            Route::Manifest
        } else if has_extension(path, SEGMENT_EXTENSIONS) {
            Route::Segment
        } else {
            Route::Default
        }
    }
}

fn has_extension(path: &str, extensions: &[&str]) -> bool {
    let name = path.rsplit('/').next().unwrap_or(path);
    match name.rfind('.') {
        Some(pos) => {
            let ext = &name[pos + 1..];
            extensions.iter().any(|e| e.eq_ignore_ascii_case(ext))
        },
        None => false,
    }
}
