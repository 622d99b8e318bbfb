//! Compiles routes into vulcand's matcher expressions.

use romulus_core::{Route, RouteKind, RoutePart};

/// The expression used for a route without predicates.
pub const MATCH_ALL: &str = r#"PathRegexp("/.*")"#;

/// Renders a route as a conjunction of vulcand matchers.
///
/// Parts of one kind are alternatives: a single part becomes a plain matcher,
/// several become one anchored regexp disjunction. Header parts are grouped by
/// header name.
pub fn compile(route: &Route) -> String {
    if route.is_empty() {
        return MATCH_ALL.to_string();
    }

    let mut matchers = Vec::new();
    push_kind(&mut matchers, route, RouteKind::Host, "Host");
    push_paths(&mut matchers, route);
    push_kind(&mut matchers, route, RouteKind::Method, "Method");

    let mut names = route
        .parts_of(RouteKind::Header)
        .filter_map(RoutePart::header)
        .collect::<Vec<_>>();
    names.sort_unstable();
    names.dedup();
    for name in names {
        let parts = route
            .parts_of(RouteKind::Header)
            .filter(|p| p.header() == Some(name))
            .collect::<Vec<_>>();
        let matcher = match parts.as_slice() {
            [part] if !part.is_regex() => {
                format!("Header({}, {})", quote(name), quote(part.value()))
            }
            [part] => format!("HeaderRegexp({}, {})", quote(name), quote(part.value())),
            parts => format!(
                "HeaderRegexp({}, {})",
                quote(name),
                quote(&disjunction(parts))
            ),
        };
        matchers.push(matcher);
    }

    matchers.join(" && ")
}

fn push_kind(matchers: &mut Vec<String>, route: &Route, kind: RouteKind, name: &str) {
    let parts = route.parts_of(kind).collect::<Vec<_>>();
    match parts.as_slice() {
        [] => {}
        [part] if !part.is_regex() => matchers.push(format!("{name}({})", quote(part.value()))),
        [part] => matchers.push(format!("{name}Regexp({})", quote(part.value()))),
        parts => matchers.push(format!(
            "{name}Regexp({})",
            quote(&disjunction(parts))
        )),
    }
}

/// Paths and prefixes both match the request path, so they are rendered as a
/// single matcher.
fn push_paths(matchers: &mut Vec<String>, route: &Route) {
    let paths = route.parts_of(RouteKind::Path).collect::<Vec<_>>();
    let prefixes = route.parts_of(RouteKind::Prefix).collect::<Vec<_>>();

    match (paths.as_slice(), prefixes.as_slice()) {
        ([], []) => {}
        ([path], []) if !path.is_regex() => {
            matchers.push(format!("Path({})", quote(path.value())));
        }
        ([path], []) => matchers.push(format!("PathRegexp({})", quote(path.value()))),
        ([], [prefix]) => {
            matchers.push(format!("PathRegexp({})", quote(&prefix_pattern(prefix))));
        }
        (paths, prefixes) => {
            let alternatives = paths
                .iter()
                .map(|p| exact_pattern(p))
                .chain(prefixes.iter().map(|p| prefix_pattern(p)))
                .collect::<Vec<_>>();
            matchers.push(format!(
                "PathRegexp({})",
                quote(&format!("^(?:{})", alternatives.join("|")))
            ));
        }
    }
}

fn disjunction(parts: &[&RoutePart]) -> String {
    let alternatives = parts.iter().map(|p| alternative(p)).collect::<Vec<_>>();
    format!("^({})$", alternatives.join("|"))
}

fn alternative(part: &RoutePart) -> String {
    if part.is_regex() {
        format!("(?:{})", part.value())
    } else {
        regex::escape(part.value())
    }
}

fn exact_pattern(part: &RoutePart) -> String {
    if part.is_regex() {
        format!("(?:{})", part.value())
    } else {
        format!("{}$", regex::escape(part.value()))
    }
}

fn prefix_pattern(part: &RoutePart) -> String {
    if part.is_regex() {
        format!("^{}", part.value().trim_start_matches('^'))
    } else {
        format!("^{}", regex::escape(part.value()))
    }
}

/// Quotes a matcher argument.
fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(f: impl FnOnce(&mut Route)) -> Route {
        let mut route = Route::default();
        f(&mut route);
        route
    }

    #[test]
    fn empty_route_matches_everything() {
        assert_eq!(compile(&Route::default()), MATCH_ALL);
    }

    #[test]
    fn compiles_matchers() {
        for (route, expected) in [
            (
                route(|r| r.add_host("example.com").unwrap()),
                r#"Host("example.com")"#,
            ),
            (
                route(|r| r.add_host("|^.*\\.example\\.com$|").unwrap()),
                r#"HostRegexp("^.*\\.example\\.com$")"#,
            ),
            (route(|r| r.add_path("/status").unwrap()), r#"Path("/status")"#),
            (
                route(|r| r.add_prefix("/api.v1").unwrap()),
                r#"PathRegexp("^/api\\.v1")"#,
            ),
            (route(|r| r.add_method("get").unwrap()), r#"Method("GET")"#),
            (
                route(|r| {
                    r.add_method("GET").unwrap();
                    r.add_method("POST").unwrap();
                }),
                r#"MethodRegexp("^(GET|POST)$")"#,
            ),
            (
                route(|r| r.add_header("X-Env", "prod").unwrap()),
                r#"Header("X-Env", "prod")"#,
            ),
            (
                route(|r| r.add_header("X-Env", "|^pr.*|").unwrap()),
                r#"HeaderRegexp("X-Env", "^pr.*")"#,
            ),
            (
                route(|r| {
                    r.add_host("example.com").unwrap();
                    r.add_prefix("/api").unwrap();
                    r.add_method("GET").unwrap();
                }),
                r#"Host("example.com") && PathRegexp("^/api") && Method("GET")"#,
            ),
        ] {
            assert_eq!(compile(&route), expected, "{route}");
        }
    }

    #[test]
    fn multiple_paths_share_one_matcher() {
        let r = route(|r| {
            r.add_path("/status").unwrap();
            r.add_prefix("/api").unwrap();
        });
        assert_eq!(compile(&r), r#"PathRegexp("^(?:/status$|^/api)")"#);
    }

    #[test]
    fn quotes_are_escaped() {
        let r = route(|r| r.add_header("X-Quote", "a\"b").unwrap());
        assert_eq!(compile(&r), r#"Header("X-Quote", "a\"b")"#);
    }
}
