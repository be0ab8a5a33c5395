//! Mapping of URLs between the proxy's own address and the origin server's.

use url::Url;

/// Swaps the scheme, host and port of URLs between the local and remote namespaces, leaving path
/// and query untouched.
#[derive(Debug, Clone)]
pub struct UrlRewriter {
    local: Url,
    remote: Url,
}

impl UrlRewriter {
    /// Only the origins of the given URLs are retained.  Returns `None` if either has no host.
    pub fn new(local: &Url, remote: &Url) -> Option<UrlRewriter> {
        Some(UrlRewriter {
            local: origin_base(local)?,
            remote: origin_base(remote)?,
        })
    }

    /// e.g. `http://127.0.0.1:8080/`
    pub fn local_base(&self) -> &Url {
        &self.local
    }

    /// e.g. `https://cdn.example.com/`
    pub fn remote_base(&self) -> &Url {
        &self.remote
    }

    pub fn to_remote(&self, url: &Url) -> Option<Url> {
        with_origin(url, &self.remote)
    }

    pub fn to_local(&self, url: &Url) -> Option<Url> {
        with_origin(url, &self.local)
    }

    /// The origin URL for a request received by the proxy, given the request's path and query.
    pub fn remote_for_request(&self, path_and_query: &str) -> Option<Url> {
        let local = self.local.join(path_and_query).ok()?;
        self.to_remote(&local)
    }

    /// Replace every occurrence of the remote base URL in the given playlist text with the local
    /// base URL, ignoring ASCII case.
    pub fn rewrite_body(&self, text: &str) -> String {
        replace_ignore_ascii_case(text, self.remote.as_str(), self.local.as_str())
    }
}

fn origin_base(url: &Url) -> Option<Url> {
    url.host_str()?;
    Url::parse(&format!("{}/", url.origin().ascii_serialization())).ok()
}

fn with_origin(url: &Url, origin: &Url) -> Option<Url> {
    let mut out = url.clone();
    out.set_scheme(origin.scheme()).ok()?;
    out.set_host(origin.host_str()).ok()?;
    out.set_port(origin.port()).ok()?;
    Some(out)
}

fn replace_ignore_ascii_case(haystack: &str, needle: &str, replacement: &str) -> String {
    if needle.is_empty() {
        return haystack.to_string();
    }
    // ASCII lowercasing keeps byte offsets unchanged, so match positions carry over
    let lower_haystack = haystack.to_ascii_lowercase();
    let lower_needle = needle.to_ascii_lowercase();
    let mut out = String::with_capacity(haystack.len());
    let mut last = 0;
    for (pos, _) in lower_haystack.match_indices(&lower_needle) {
        out.push_str(&haystack[last..pos]);
        out.push_str(replacement);
        last = pos + needle.len();
    }
    out.push_str(&haystack[last..]);
    out
}
