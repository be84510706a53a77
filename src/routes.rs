//! Request classification for the sidecar

use axum::http::Method;
use reqwest::Url;

/// AJAX actions that place or approve an order, matched against the query string
pub const PROTECTED_AJAX_ENDPOINTS: [&str; 3] = [
    "wc-ajax=ppc-create-order",
    "wc-ajax=ppc-approve-order",
    "wc-ajax=checkout",
];

/// Store API checkout routes, matched against the path or `rest_route`
pub const PROTECTED_REST_ROUTES: [&str; 2] = ["/wc/store/checkout", "/wc/store/v1/checkout"];

/// Pages whose views issue a fresh token
pub const TOKEN_PAGES: [&str; 2] = ["/checkout", "/cart"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteKind {
    /// Checkout or cart page view
    PageView,
    /// Order-placing endpoint; `endpoint` is the label stored in the audit log
    Protected { endpoint: String },
    Passthrough,
}

/// Which requests the guard cares about
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtectedRoutes {
    pub ajax_endpoints: Vec<String>,
    pub rest_routes: Vec<String>,
    pub token_pages: Vec<String>,
}

impl Default for ProtectedRoutes {
    fn default() -> Self {
        Self {
            ajax_endpoints: PROTECTED_AJAX_ENDPOINTS.iter().map(|s| s.to_string()).collect(),
            rest_routes: PROTECTED_REST_ROUTES.iter().map(|s| s.to_string()).collect(),
            token_pages: TOKEN_PAGES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl ProtectedRoutes {
    pub fn classify(&self, method: &Method, path: &str, query: Option<&str>) -> RouteKind {
        let query = query.unwrap_or("");

        if method == Method::POST {
            if self.ajax_endpoints.iter().any(|e| query.contains(e.as_str())) {
                return RouteKind::Protected {
                    endpoint: query.to_string(),
                };
            }

            let rest_route = rest_route_param(query);
            let matched = self.rest_routes.iter().find(|route| {
                path.contains(route.as_str())
                    || rest_route.as_deref().is_some_and(|r| r.contains(route.as_str()))
            });
            if let Some(route) = matched {
                return RouteKind::Protected {
                    endpoint: route.clone(),
                };
            }
        }

        if method == Method::GET && self.is_token_page(path) {
            return RouteKind::PageView;
        }

        RouteKind::Passthrough
    }

    fn is_token_page(&self, path: &str) -> bool {
        let trimmed = path.trim_end_matches('/');
        self.token_pages.iter().any(|page| page.trim_end_matches('/') == trimmed)
    }
}

/// Decoded `rest_route` query value, for sites without pretty permalinks.
fn rest_route_param(query: &str) -> Option<String> {
    if !query.contains("rest_route") {
        return None;
    }
    let url = Url::parse(&format!("http://localhost/?{}", query)).ok()?;
    url.query_pairs()
        .find(|(key, _)| key == "rest_route")
        .map(|(_, value)| value.into_owned())
}
