use crate::annotations::{self, Annotations};
use regex::Regex;
use std::fmt;

/// A set of request predicates. An empty route matches every request.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Route {
    parts: Vec<RoutePart>,
}

#[derive(Clone, Debug)]
pub struct RoutePart {
    kind: RouteKind,
    value: String,
    header: Option<String>,
    pattern: Option<Regex>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RouteKind {
    Host,
    Path,
    Prefix,
    Method,
    Header,
}

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("invalid pattern {value:?}: {source}")]
    InvalidPattern {
        value: String,
        #[source]
        source: regex::Error,
    },

    #[error("invalid header match {0:?}: expected Name=Value")]
    InvalidHeader(String),
}

/// Builds a route from flattened annotations.
///
/// Invalid values are logged and dropped; the remaining parts still form a
/// route.
pub fn build_route(id: &str, annotations: &Annotations) -> Route {
    let mut route = Route::default();

    for (key, value) in annotations {
        let value = value.trim();
        if value.is_empty() {
            continue;
        }

        let result = match key.as_str() {
            annotations::HOST => route.add_host(value),
            annotations::PATH => route.add_path(value),
            annotations::PREFIX => route.add_prefix(value),
            annotations::METHODS => {
                for method in split_list(value) {
                    if let Err(error) = route.add_method(method) {
                        tracing::warn!(resource = %id, %error, "Dropping method match");
                    }
                }
                Ok(())
            }
            annotations::HEADERS => {
                for header in split_list(value) {
                    let res = match header.split_once('=') {
                        Some((name, value)) if !name.trim().is_empty() => {
                            route.add_header(name.trim(), value.trim())
                        }
                        _ => Err(RouteError::InvalidHeader(header.to_string())),
                    };
                    if let Err(error) = res {
                        tracing::warn!(resource = %id, %error, "Dropping header match");
                    }
                }
                Ok(())
            }
            _ => Ok(()),
        };

        if let Err(error) = result {
            tracing::warn!(resource = %id, annotation = %key, %error, "Dropping route annotation");
        }
    }

    route
}

fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value
        .split(|c: char| c == ';' || c.is_whitespace())
        .filter(|s| !s.is_empty())
}

/// Returns the expression framed by `|...|`, if any.
fn framed_pattern(value: &str) -> Option<&str> {
    if value.len() >= 2 && value.starts_with('|') && value.ends_with('|') {
        Some(&value[1..value.len() - 1])
    } else {
        None
    }
}

// === impl Route ===

impl Route {
    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    pub fn parts(&self) -> &[RoutePart] {
        &self.parts
    }

    pub fn parts_of(&self, kind: RouteKind) -> impl Iterator<Item = &RoutePart> {
        self.parts.iter().filter(move |p| p.kind == kind)
    }

    pub fn add_host(&mut self, value: &str) -> Result<(), RouteError> {
        self.push(RoutePart::parse(RouteKind::Host, value, None)?);
        Ok(())
    }

    pub fn add_path(&mut self, value: &str) -> Result<(), RouteError> {
        self.push(RoutePart::parse(RouteKind::Path, value, None)?);
        Ok(())
    }

    pub fn add_prefix(&mut self, value: &str) -> Result<(), RouteError> {
        self.push(RoutePart::parse(RouteKind::Prefix, value, None)?);
        Ok(())
    }

    pub fn add_method(&mut self, value: &str) -> Result<(), RouteError> {
        let mut part = RoutePart::parse(RouteKind::Method, value, None)?;
        if part.pattern.is_none() {
            part.value = part.value.to_ascii_uppercase();
        }
        self.push(part);
        Ok(())
    }

    pub fn add_header(&mut self, name: &str, value: &str) -> Result<(), RouteError> {
        self.push(RoutePart::parse(
            RouteKind::Header,
            value,
            Some(name.to_string()),
        )?);
        Ok(())
    }

    /// Replaces every host part with `value`.
    pub fn set_host(&mut self, value: &str) -> Result<(), RouteError> {
        let part = RoutePart::parse(RouteKind::Host, value, None)?;
        self.parts.retain(|p| p.kind != RouteKind::Host);
        self.push(part);
        Ok(())
    }

    /// Replaces every path and prefix part with an exact path.
    pub fn set_path(&mut self, value: &str) -> Result<(), RouteError> {
        let part = RoutePart::parse(RouteKind::Path, value, None)?;
        self.clear_paths();
        self.push(part);
        Ok(())
    }

    /// Replaces every path and prefix part with a prefix.
    pub fn set_prefix(&mut self, value: &str) -> Result<(), RouteError> {
        let part = RoutePart::parse(RouteKind::Prefix, value, None)?;
        self.clear_paths();
        self.push(part);
        Ok(())
    }

    fn clear_paths(&mut self) {
        self.parts
            .retain(|p| !matches!(p.kind, RouteKind::Path | RouteKind::Prefix));
    }

    fn push(&mut self, part: RoutePart) {
        if !self.parts.contains(&part) {
            self.parts.push(part);
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.parts.is_empty() {
            return f.write_str("*");
        }
        for (i, part) in self.parts.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{part}")?;
        }
        Ok(())
    }
}

// === impl RoutePart ===

impl RoutePart {
    fn parse(kind: RouteKind, value: &str, header: Option<String>) -> Result<Self, RouteError> {
        match framed_pattern(value) {
            Some(expr) => {
                let pattern = Regex::new(expr).map_err(|source| RouteError::InvalidPattern {
                    value: value.to_string(),
                    source,
                })?;
                Ok(Self {
                    kind,
                    value: expr.to_string(),
                    header,
                    pattern: Some(pattern),
                })
            }
            None => Ok(Self {
                kind,
                value: value.to_string(),
                header,
                pattern: None,
            }),
        }
    }

    pub fn kind(&self) -> RouteKind {
        self.kind
    }

    /// The literal value, or the expression source for regex parts.
    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn header(&self) -> Option<&str> {
        self.header.as_deref()
    }

    pub fn is_regex(&self) -> bool {
        self.pattern.is_some()
    }

    pub fn pattern(&self) -> Option<&Regex> {
        self.pattern.as_ref()
    }
}

impl PartialEq for RoutePart {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.value == other.value
            && self.header == other.header
            && self.pattern.as_ref().map(Regex::as_str) == other.pattern.as_ref().map(Regex::as_str)
    }
}

impl Eq for RoutePart {}

impl fmt::Display for RoutePart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            RouteKind::Host => "host",
            RouteKind::Path => "path",
            RouteKind::Prefix => "prefix",
            RouteKind::Method => "method",
            RouteKind::Header => "header",
        };
        match (&self.header, self.is_regex()) {
            (Some(h), true) => write!(f, "{kind}[{h}]~|{}|", self.value),
            (Some(h), false) => write!(f, "{kind}[{h}]={}", self.value),
            (None, true) => write!(f, "{kind}~|{}|", self.value),
            (None, false) => write!(f, "{kind}={}", self.value),
        }
    }
}
