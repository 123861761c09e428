// ── Request routing ──
//
// Picks the target printer for an inbound request. Precedence:
//
//   1. `id` / `mainboard_id` query parameter
//   2. `/printer/<id>/...` path prefix
//   3. the same two forms inside the `Referer` URL
//   4. any path segment equal to a registered id
//   5. the first registered printer
//
// Only registered ids count at every step; an unknown id falls through.
// The id that decided the route is stripped from the forwarded URL.

use axum::http::{HeaderMap, Uri, header};
use url::form_urlencoded;

pub const QUERY_KEYS: [&str; 2] = ["id", "mainboard_id"];
pub const PATH_PREFIX: &str = "/printer/";

/// Which precedence step chose the printer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteSource {
    Query,
    Path,
    Referer,
    Segment,
    Fallback,
}

impl RouteSource {
    /// Whether the client named a printer, directly or through its referer.
    pub fn is_explicit(self) -> bool {
        !matches!(self, Self::Fallback)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub device_id: String,
    pub source: RouteSource,
    /// Path and query to send upstream, with the routing id removed.
    pub path_and_query: String,
}

/// Resolve a request against the registered ids, in registration order.
pub fn resolve(registered: &[String], uri: &Uri, headers: &HeaderMap) -> Option<Route> {
    let referer = headers.get(header::REFERER).and_then(|v| v.to_str().ok());
    resolve_parts(registered, uri.path(), uri.query(), referer)
}

/// Resolution over raw request parts.
pub fn resolve_parts(
    registered: &[String],
    path: &str,
    query: Option<&str>,
    referer: Option<&str>,
) -> Option<Route> {
    let known = |id: &str| registered.iter().any(|r| r == id);
    let query = query.unwrap_or_default();

    if let Some(id) = id_from_query(query, &known) {
        let stripped = strip_query_id(query, &id);
        return Some(route(id, RouteSource::Query, path, &stripped));
    }

    if let Some((id, rest)) = id_from_path_prefix(path, &known) {
        return Some(route(id, RouteSource::Path, &rest, query));
    }

    if let Some(id) = referer.and_then(|r| id_from_referer(r, &known)) {
        return Some(route(id, RouteSource::Referer, path, query));
    }

    if let Some((id, rest)) = id_from_segments(path, &known) {
        return Some(route(id, RouteSource::Segment, &rest, query));
    }

    registered
        .first()
        .map(|id| route(id.clone(), RouteSource::Fallback, path, query))
}

fn route(device_id: String, source: RouteSource, path: &str, query: &str) -> Route {
    let path = if path.is_empty() { "/" } else { path };
    let path_and_query = if query.is_empty() {
        path.to_owned()
    } else {
        format!("{path}?{query}")
    };
    Route {
        device_id,
        source,
        path_and_query,
    }
}

// ── Precedence steps ─────────────────────────────────────────────────

fn id_from_query(query: &str, known: &impl Fn(&str) -> bool) -> Option<String> {
    QUERY_KEYS.iter().find_map(|key| {
        form_urlencoded::parse(query.as_bytes())
            .find(|(k, v)| k == key && known(v))
            .map(|(_, v)| v.into_owned())
    })
}

fn strip_query_id(query: &str, id: &str) -> String {
    let mut out = form_urlencoded::Serializer::new(String::new());
    for (key, value) in form_urlencoded::parse(query.as_bytes()) {
        if QUERY_KEYS.contains(&&*key) && value == id {
            continue;
        }
        out.append_pair(&key, &value);
    }
    out.finish()
}

fn id_from_path_prefix(path: &str, known: &impl Fn(&str) -> bool) -> Option<(String, String)> {
    let rest = path.strip_prefix(PATH_PREFIX)?;
    let (id, tail) = rest.split_once('/').map_or((rest, ""), |(id, tail)| (id, tail));
    known(id).then(|| (id.to_owned(), format!("/{tail}")))
}

fn id_from_referer(referer: &str, known: &impl Fn(&str) -> bool) -> Option<String> {
    let url = url::Url::parse(referer).ok()?;
    id_from_query(url.query().unwrap_or_default(), known)
        .or_else(|| id_from_path_prefix(url.path(), known).map(|(id, _)| id))
        .or_else(|| id_from_segments(url.path(), known).map(|(id, _)| id))
}

fn id_from_segments(path: &str, known: &impl Fn(&str) -> bool) -> Option<(String, String)> {
    let segments: Vec<&str> = path.split('/').collect();
    let index = segments.iter().position(|s| !s.is_empty() && known(s))?;
    let id = (*segments.get(index)?).to_owned();
    let rest: Vec<&str> = segments
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != index)
        .map(|(_, s)| *s)
        .collect();
    let rest = rest.join("/");
    Some((id, if rest.starts_with('/') { rest } else { format!("/{rest}") }))
}
