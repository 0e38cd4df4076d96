//! Group-Version-Info: parsed identity of a CR kind.
//!
//! Pluralisation of the default plural kind name is handled by the
//! `inflector` crate.

use std::cmp::Ordering;
use std::sync::OnceLock;

use inflector::Inflector;
use regex::Regex;

use crate::error::{Error, Result};

fn version_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^v(\d+)(?:(alpha|beta)(\d+))?$").unwrap())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stability {
    Alpha,
    Beta,
    Stable,
}

impl Stability {
    fn from_token(token: Option<&str>) -> Result<Self> {
        match token {
            None => Ok(Stability::Stable),
            Some("alpha") => Ok(Stability::Alpha),
            Some("beta") => Ok(Stability::Beta),
            Some(other) => Err(Error::InvalidVersion(format!(
                "unknown stability level: {other}"
            ))),
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Stability::Alpha => "Alpha",
            Stability::Beta => "Beta",
            Stability::Stable => "Stable",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    Namespaced,
    Cluster,
}

/// Identity tuple (group, apiVersion, kind) plus its derived plural/singular
/// form, parsed `major.stability.minor` ordering key, and CRD name.
#[derive(Debug, Clone)]
pub struct GroupVersionInfo {
    pub group: String,
    pub api_version: String,
    pub major: u32,
    pub stability: Stability,
    pub minor: u32,
    pub kind: String,
    pub singular: String,
    pub plural: String,
    pub crd_name: String,
    pub scope: Scope,
    pub short_names: Vec<String>,
}

pub struct GroupVersionInfoBuilder {
    singular: Option<String>,
    plural: Option<String>,
    crd_name: Option<String>,
    short_names: Vec<String>,
    scope: Scope,
}

impl Default for GroupVersionInfoBuilder {
    fn default() -> Self {
        Self {
            singular: None,
            plural: None,
            crd_name: None,
            short_names: Vec::new(),
            scope: Scope::Namespaced,
        }
    }
}

impl GroupVersionInfoBuilder {
    pub fn singular(mut self, s: impl Into<String>) -> Self {
        self.singular = Some(s.into());
        self
    }

    pub fn plural(mut self, s: impl Into<String>) -> Self {
        self.plural = Some(s.into());
        self
    }

    pub fn crd_name(mut self, s: impl Into<String>) -> Self {
        self.crd_name = Some(s.into());
        self
    }

    pub fn short_names(mut self, s: Vec<String>) -> Self {
        self.short_names = s;
        self
    }

    pub fn scope(mut self, s: Scope) -> Self {
        self.scope = s;
        self
    }

    pub fn build(self, group: impl Into<String>, api_version: impl Into<String>, kind: impl Into<String>) -> Result<GroupVersionInfo> {
        GroupVersionInfo::build(group, api_version, kind, self)
    }
}

impl GroupVersionInfo {
    /// Validates `api_version` against `^v(\d+)(?:(alpha|beta)(\d+))?$`.
    pub fn is_valid_api_version(api_version: &str) -> bool {
        version_pattern().is_match(api_version)
    }

    /// Construct with defaulted singular/plural/crd_name, as the Python
    /// `__init__` does when kwargs are omitted.
    pub fn new(group: impl Into<String>, api_version: impl Into<String>, kind: impl Into<String>) -> Result<Self> {
        GroupVersionInfoBuilder::default().build(group, api_version, kind)
    }

    pub fn builder() -> GroupVersionInfoBuilder {
        GroupVersionInfoBuilder::default()
    }

    fn build(
        group: impl Into<String>,
        api_version: impl Into<String>,
        kind: impl Into<String>,
        opts: GroupVersionInfoBuilder,
    ) -> Result<Self> {
        let api_version = api_version.into();
        let kind = kind.into();
        let group = group.into();

        let caps = version_pattern()
            .captures(&api_version)
            .ok_or_else(|| Error::InvalidVersion(format!("Invalid format {api_version}")))?;

        let major: u32 = caps[1]
            .parse()
            .map_err(|_| Error::InvalidVersion(format!("Invalid format {api_version}")))?;
        let stability = Stability::from_token(caps.get(2).map(|m| m.as_str()))?;
        let minor: u32 = caps
            .get(3)
            .map(|m| m.as_str().parse().unwrap_or(0))
            .unwrap_or(0);

        let singular = opts.singular.unwrap_or_else(|| kind.to_lowercase());
        let plural = opts.plural.unwrap_or_else(|| kind.to_lowercase().to_plural());
        let crd_name = opts.crd_name.unwrap_or_else(|| format!("{plural}.{group}"));

        Ok(GroupVersionInfo {
            group,
            api_version,
            major,
            stability,
            minor,
            kind,
            singular,
            plural,
            crd_name,
            scope: opts.scope,
            short_names: opts.short_names,
        })
    }

    /// "V<major><Stability><minorOrBlank>"
    pub fn pretty_version(&self) -> String {
        let minor = if self.minor != 0 {
            self.minor.to_string()
        } else {
            String::new()
        };
        format!("V{}{}{}", self.major, self.stability.label(), minor)
    }

    /// "<Kind>V…[(Namespace=…,Name=…)]"
    pub fn pretty_kind(&self, namespace_name: Option<(&str, &str)>) -> String {
        match namespace_name {
            Some((namespace, name)) => format!(
                "{}{}(Namespace={namespace}, Name={name})",
                self.kind,
                self.pretty_version()
            ),
            None => format!("{}{}", self.kind, self.pretty_version()),
        }
    }

    fn key(&self) -> (u32, Stability, u32) {
        (self.major, self.stability, self.minor)
    }
}

impl PartialEq for GroupVersionInfo {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}
impl Eq for GroupVersionInfo {}

impl PartialOrd for GroupVersionInfo {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for GroupVersionInfo {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_stable_version() {
        let gvi = GroupVersionInfo::new("example.com", "v1", "Widget").unwrap();
        assert_eq!(gvi.major, 1);
        assert_eq!(gvi.stability, Stability::Stable);
        assert_eq!(gvi.minor, 0);
        assert_eq!(gvi.pretty_version(), "V1Stable");
    }

    #[test]
    fn parses_alpha_version_with_minor() {
        let gvi = GroupVersionInfo::new("example.com", "v1alpha2", "Widget").unwrap();
        assert_eq!(gvi.stability, Stability::Alpha);
        assert_eq!(gvi.minor, 2);
        assert_eq!(gvi.pretty_version(), "V1Alpha2");
    }

    #[test]
    fn v0_is_valid_major_zero() {
        let gvi = GroupVersionInfo::new("example.com", "v0", "Widget").unwrap();
        assert_eq!(gvi.major, 0);
    }

    #[test]
    fn v1alpha0_parses_minor_zero() {
        let gvi = GroupVersionInfo::new("example.com", "v1alpha0", "Widget").unwrap();
        assert_eq!(gvi.minor, 0);
        assert_eq!(gvi.stability, Stability::Alpha);
    }

    #[test]
    fn v1beta_without_digit_rejects() {
        let err = GroupVersionInfo::new("example.com", "v1beta", "Widget");
        assert!(err.is_err());
    }

    #[test]
    fn unknown_stability_token_rejects() {
        assert!(!GroupVersionInfo::is_valid_api_version("v1gamma2"));
    }

    #[test]
    fn defaults_singular_plural_crd_name() {
        let gvi = GroupVersionInfo::new("example.com", "v1", "Widget").unwrap();
        assert_eq!(gvi.singular, "widget");
        assert_eq!(gvi.plural, "widgets");
        assert_eq!(gvi.crd_name, "widgets.example.com");
    }

    #[test]
    fn ordering_is_major_stability_minor() {
        let a = GroupVersionInfo::new("g", "v1alpha1", "K").unwrap();
        let b = GroupVersionInfo::new("g", "v1beta1", "K").unwrap();
        let c = GroupVersionInfo::new("g", "v1", "K").unwrap();
        let d = GroupVersionInfo::new("g", "v2alpha1", "K").unwrap();
        assert!(a < b);
        assert!(b < c);
        assert!(c < d);
    }

    #[test]
    fn pretty_kind_with_namespace_name() {
        let gvi = GroupVersionInfo::new("example.com", "v1", "Widget").unwrap();
        assert_eq!(
            gvi.pretty_kind(Some(("default", "foo"))),
            "WidgetV1Stable(Namespace=default, Name=foo)"
        );
    }
}
