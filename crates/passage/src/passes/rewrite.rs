//! Response rewriting applied while copying an upstream response back to the
//! client: HTTP/1.0 hygiene, redirect-Location rewriting and Set-Cookie
//! domain/path substitution.

use hyper::header::{HeaderValue, CONNECTION, HOST, LOCATION, SET_COOKIE, TRANSFER_ENCODING};
use hyper::http::request;
use hyper::{Response, Version};
use once_cell::sync::Lazy;
use regex::Regex;
use url::Url;

use crate::body::ProxyBody;
use crate::options::{ProxyOptions, RewriteMap};

static COOKIE_DOMAIN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(;\s*domain=)([^;]+)").unwrap());
static COOKIE_PATH_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)(;\s*path=)([^;]+)").unwrap());

/// Redirect statuses whose `Location` header is eligible for rewriting.
const REDIRECT_CODES: [u16; 5] = [201, 301, 302, 307, 308];

/// HTTP/1.0 clients cannot consume chunked bodies.
pub(crate) fn remove_chunked(inbound: &request::Parts, res: &mut Response<ProxyBody>) {
    if inbound.version == Version::HTTP_10 {
        res.headers_mut().remove(TRANSFER_ENCODING);
    }
}

/// Align the response `Connection` header with what the client can handle.
pub(crate) fn set_connection(inbound: &request::Parts, res: &mut Response<ProxyBody>) {
    if inbound.version == Version::HTTP_10 {
        let value = inbound
            .headers
            .get(CONNECTION)
            .cloned()
            .unwrap_or_else(|| HeaderValue::from_static("close"));
        res.headers_mut().insert(CONNECTION, value);
    } else if inbound.version != Version::HTTP_2 && !res.headers().contains_key(CONNECTION) {
        let value = inbound
            .headers
            .get(CONNECTION)
            .cloned()
            .unwrap_or_else(|| HeaderValue::from_static("keep-alive"));
        res.headers_mut().insert(CONNECTION, value);
    }
}

fn split_host_port(value: &str) -> (&str, Option<u16>) {
    match value.rsplit_once(':') {
        Some((host, port)) => match port.parse::<u16>() {
            Ok(port) => (host, Some(port)),
            Err(_) => (value, None),
        },
        None => (value, None),
    }
}

fn location_authority(url: &Url) -> Option<String> {
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    })
}

/// Rewrite the `Location` header of redirect responses according to the
/// `host_rewrite` / `auto_rewrite` / `protocol_rewrite` policy.
///
/// Only Locations pointing at the configured target are touched; redirects
/// to other hosts pass through untouched.
pub(crate) fn rewrite_redirect(
    options: &ProxyOptions,
    inbound: &request::Parts,
    res: &mut Response<ProxyBody>,
) {
    let policy_active = options.host_rewrite.is_some()
        || options.auto_rewrite_enabled()
        || options.protocol_rewrite.is_some();
    if !policy_active || !REDIRECT_CODES.contains(&res.status().as_u16()) {
        return;
    }
    let Some(location) = res.headers().get(LOCATION).and_then(|v| v.to_str().ok()) else {
        return;
    };
    let Ok(mut url) = Url::parse(location) else {
        return;
    };
    let Some(target) = options.resolved_target() else {
        return;
    };
    if location_authority(&url).as_deref() != Some(target.url_authority().as_str()) {
        return;
    }

    if let Some(host_rewrite) = &options.host_rewrite {
        let (host, port) = split_host_port(host_rewrite);
        if url.set_host(Some(host)).is_err() {
            return;
        }
        let _ = url.set_port(port);
    } else if options.auto_rewrite_enabled() {
        let Some(inbound_host) = inbound.headers.get(HOST).and_then(|v| v.to_str().ok()) else {
            return;
        };
        let (host, port) = split_host_port(inbound_host);
        if url.set_host(Some(host)).is_err() {
            return;
        }
        let _ = url.set_port(port);
    }
    if let Some(protocol) = &options.protocol_rewrite {
        let _ = url.set_scheme(protocol);
    }

    if let Ok(value) = HeaderValue::from_str(url.as_str()) {
        res.headers_mut().insert(LOCATION, value);
    }
}

fn rewrite_cookie_value(value: &str, re: &Regex, map: &RewriteMap) -> String {
    re.replace(value, |caps: &regex::Captures| {
        match map.replacement_for(&caps[2]) {
            None => caps[0].to_string(),
            Some("") => String::new(),
            Some(replacement) => format!("{}{}", &caps[1], replacement),
        }
    })
    .into_owned()
}

/// Apply `Set-Cookie` domain and path rewrite tables. Array-valued headers
/// are rewritten element-wise.
pub(crate) fn rewrite_cookies(options: &ProxyOptions, res: &mut Response<ProxyBody>) {
    let tables: [(&Lazy<Regex>, Option<&RewriteMap>); 2] = [
        (&COOKIE_DOMAIN_RE, options.cookie_domain_rewrite.as_ref()),
        (&COOKIE_PATH_RE, options.cookie_path_rewrite.as_ref()),
    ];
    for (re, map) in tables {
        let Some(map) = map else { continue };
        let rewritten: Vec<HeaderValue> = res
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(|v| rewrite_cookie_value(v, re, map))
            .filter_map(|v| HeaderValue::from_str(&v).ok())
            .collect();
        if rewritten.is_empty() {
            continue;
        }
        res.headers_mut().remove(SET_COOKIE);
        for value in rewritten {
            res.headers_mut().append(SET_COOKIE, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body;
    use hyper::Request;
    use std::collections::HashMap;

    fn inbound_with_host(host: &str) -> request::Parts {
        let (parts, ()) = Request::builder()
            .uri("/x")
            .header("host", host)
            .body(())
            .unwrap()
            .into_parts();
        parts
    }

    fn redirect_to(location: &str) -> Response<ProxyBody> {
        Response::builder()
            .status(302)
            .header("location", location)
            .body(body::empty())
            .unwrap()
    }

    fn options_with_target(target: &str) -> ProxyOptions {
        let mut options = ProxyOptions {
            target: Some(target.into()),
            ..Default::default()
        };
        options.resolve_targets().unwrap();
        options
    }

    #[test]
    fn test_auto_rewrite_replaces_host_with_inbound() {
        let mut options = options_with_target("http://internal:9000");
        options.auto_rewrite = Some(true);
        let inbound = inbound_with_host("public.example");
        let mut res = redirect_to("http://internal:9000/x");
        rewrite_redirect(&options, &inbound, &mut res);
        assert_eq!(
            res.headers().get(LOCATION).unwrap(),
            "http://public.example/x"
        );
    }

    #[test]
    fn test_host_rewrite_uses_configured_value() {
        let mut options = options_with_target("http://internal:9000");
        options.host_rewrite = Some("edge.example:8443".to_string());
        let inbound = inbound_with_host("public.example");
        let mut res = redirect_to("http://internal:9000/login");
        rewrite_redirect(&options, &inbound, &mut res);
        assert_eq!(
            res.headers().get(LOCATION).unwrap(),
            "http://edge.example:8443/login"
        );
    }

    #[test]
    fn test_protocol_rewrite() {
        let mut options = options_with_target("http://internal:9000");
        options.protocol_rewrite = Some("https".to_string());
        let inbound = inbound_with_host("public.example");
        let mut res = redirect_to("http://internal:9000/x");
        rewrite_redirect(&options, &inbound, &mut res);
        assert_eq!(
            res.headers().get(LOCATION).unwrap(),
            "https://internal:9000/x"
        );
    }

    #[test]
    fn test_foreign_redirects_pass_through() {
        let mut options = options_with_target("http://internal:9000");
        options.auto_rewrite = Some(true);
        let inbound = inbound_with_host("public.example");
        let mut res = redirect_to("http://elsewhere.example/x");
        rewrite_redirect(&options, &inbound, &mut res);
        assert_eq!(
            res.headers().get(LOCATION).unwrap(),
            "http://elsewhere.example/x"
        );
    }

    #[test]
    fn test_non_redirect_status_untouched() {
        let mut options = options_with_target("http://internal:9000");
        options.auto_rewrite = Some(true);
        let inbound = inbound_with_host("public.example");
        let mut res = Response::builder()
            .status(200)
            .header("location", "http://internal:9000/x")
            .body(body::empty())
            .unwrap();
        rewrite_redirect(&options, &inbound, &mut res);
        assert_eq!(
            res.headers().get(LOCATION).unwrap(),
            "http://internal:9000/x"
        );
    }

    #[test]
    fn test_cookie_domain_exact_and_wildcard() {
        let mut table = HashMap::new();
        table.insert("internal".to_string(), "public.example".to_string());
        let mut options = ProxyOptions {
            cookie_domain_rewrite: Some(RewriteMap::Map(table)),
            ..Default::default()
        };
        let mut res = Response::builder()
            .status(200)
            .header("set-cookie", "sid=1; Domain=internal; Path=/")
            .body(body::empty())
            .unwrap();
        rewrite_cookies(&options, &mut res);
        assert_eq!(
            res.headers().get(SET_COOKIE).unwrap(),
            "sid=1; Domain=public.example; Path=/"
        );

        options.cookie_domain_rewrite = Some("wild.example".into());
        let mut res = Response::builder()
            .status(200)
            .header("set-cookie", "sid=1; Domain=whatever; Path=/")
            .body(body::empty())
            .unwrap();
        rewrite_cookies(&options, &mut res);
        assert_eq!(
            res.headers().get(SET_COOKIE).unwrap(),
            "sid=1; Domain=wild.example; Path=/"
        );
    }

    #[test]
    fn test_cookie_attribute_removal() {
        let mut table = HashMap::new();
        table.insert("*".to_string(), String::new());
        let options = ProxyOptions {
            cookie_domain_rewrite: Some(RewriteMap::Map(table)),
            ..Default::default()
        };
        let mut res = Response::builder()
            .status(200)
            .header("set-cookie", "sid=1; Domain=internal; Path=/")
            .body(body::empty())
            .unwrap();
        rewrite_cookies(&options, &mut res);
        assert_eq!(res.headers().get(SET_COOKIE).unwrap(), "sid=1; Path=/");
    }

    #[test]
    fn test_cookie_array_rewritten_element_wise() {
        let options = ProxyOptions {
            cookie_path_rewrite: Some("/app".into()),
            ..Default::default()
        };
        let mut res = Response::builder()
            .status(200)
            .header("set-cookie", "a=1; Path=/old")
            .header("set-cookie", "b=2; Path=/other")
            .body(body::empty())
            .unwrap();
        rewrite_cookies(&options, &mut res);
        let values: Vec<_> = res
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .map(|v| v.to_str().unwrap().to_string())
            .collect();
        assert_eq!(values, vec!["a=1; Path=/app", "b=2; Path=/app"]);
    }

    #[test]
    fn test_http10_hygiene() {
        let (mut parts, ()) = Request::builder().uri("/").body(()).unwrap().into_parts();
        parts.version = Version::HTTP_10;
        let mut res = Response::builder()
            .status(200)
            .header("transfer-encoding", "chunked")
            .body(body::empty())
            .unwrap();
        remove_chunked(&parts, &mut res);
        assert!(res.headers().get(TRANSFER_ENCODING).is_none());
        set_connection(&parts, &mut res);
        assert_eq!(res.headers().get(CONNECTION).unwrap(), "close");
    }

    #[test]
    fn test_http11_defaults_keep_alive() {
        let (parts, ()) = Request::builder().uri("/").body(()).unwrap().into_parts();
        let mut res = Response::builder()
            .status(200)
            .body(body::empty())
            .unwrap();
        set_connection(&parts, &mut res);
        assert_eq!(res.headers().get(CONNECTION).unwrap(), "keep-alive");
    }
}
