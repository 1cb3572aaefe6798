//! Parsing of cluster connection descriptors.
//!
//! A descriptor is a URL-shaped string naming the placement service
//! endpoints of one cluster, e.g.
//! `meridian://placement-1:2379,placement-2:2379?disableGC=false`.
//! The authority holds a comma separated endpoint list, which is why we
//! split it by hand instead of handing the whole string to a URL parser.

use std::fmt;

use errors::ErrorMetadata;
use url::form_urlencoded;

pub const DESCRIPTOR_SCHEME: &str = "meridian";

const DISABLE_GC_OPTION: &str = "disableGC";

/// Parsed form of a connection descriptor. Used as the input to a
/// [`ClusterClientFactory`](crate::clients::ClusterClientFactory) and kept on
/// the store handle for diagnostics.
///
/// [`parse`](Self::parse) fails with an `InvalidConfiguration` error on a
/// malformed descriptor; it never falls back to defaults.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionSpec {
    pub placement_addrs: Vec<String>,
    pub disable_gc: bool,
}

impl ConnectionSpec {
    pub fn parse(descriptor: &str) -> anyhow::Result<Self> {
        let Some((scheme, rest)) = descriptor.split_once("://") else {
            return Err(anyhow::anyhow!("missing scheme in {descriptor:?}").context(
                ErrorMetadata::invalid_configuration(
                    "DescriptorMalformed",
                    format!("connection descriptor {descriptor:?} is not a URL"),
                ),
            ));
        };
        if !scheme.eq_ignore_ascii_case(DESCRIPTOR_SCHEME) {
            return Err(anyhow::anyhow!("scheme was {scheme:?}").context(
                ErrorMetadata::invalid_configuration(
                    "DescriptorSchemeMismatch",
                    format!(
                        "connection descriptor {descriptor:?} must use the \
                         {DESCRIPTOR_SCHEME}:// scheme"
                    ),
                ),
            ));
        }
        let (authority, query) = match rest.split_once('?') {
            Some((authority, query)) => (authority, query),
            None => (rest, ""),
        };
        let placement_addrs: Vec<String> = authority
            .split(',')
            .filter(|addr| !addr.is_empty())
            .map(String::from)
            .collect();
        if placement_addrs.is_empty() {
            return Err(anyhow::anyhow!("empty authority").context(
                ErrorMetadata::invalid_configuration(
                    "DescriptorMissingEndpoints",
                    format!("connection descriptor {descriptor:?} names no placement endpoints"),
                ),
            ));
        }
        let mut disable_gc = false;
        for (key, value) in form_urlencoded::parse(query.as_bytes()) {
            if key != DISABLE_GC_OPTION {
                continue;
            }
            disable_gc = match &*value {
                "true" => true,
                "false" | "" => false,
                other => {
                    return Err(anyhow::anyhow!("disableGC was {other:?}").context(
                        ErrorMetadata::invalid_configuration(
                            "InvalidDisableGcFlag",
                            format!(
                                "{DISABLE_GC_OPTION} flag in {descriptor:?} should be true or \
                                 false"
                            ),
                        ),
                    ));
                },
            };
        }
        Ok(Self {
            placement_addrs,
            disable_gc,
        })
    }
}

impl fmt::Display for ConnectionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{DESCRIPTOR_SCHEME}://{}?{DISABLE_GC_OPTION}={}",
            self.placement_addrs.join(","),
            self.disable_gc
        )
    }
}

#[cfg(test)]
mod tests {
    use errors::ErrorMetadataAnyhowExt;

    use super::ConnectionSpec;

    #[test]
    fn test_parse_multiple_endpoints() -> anyhow::Result<()> {
        let spec = ConnectionSpec::parse("meridian://pl-1:2379,pl-2:2379,pl-3:2379")?;
        assert_eq!(spec.placement_addrs, vec!["pl-1:2379", "pl-2:2379", "pl-3:2379"]);
        assert!(!spec.disable_gc);
        Ok(())
    }

    #[test]
    fn test_parse_disable_gc() -> anyhow::Result<()> {
        let spec = ConnectionSpec::parse("meridian://pl-1:2379?disableGC=true")?;
        assert!(spec.disable_gc);
        let spec = ConnectionSpec::parse("Meridian://pl-1:2379?disableGC=false")?;
        assert!(!spec.disable_gc);
        // An empty value means the flag is unset.
        let spec = ConnectionSpec::parse("meridian://pl-1:2379?disableGC=")?;
        assert!(!spec.disable_gc);
        Ok(())
    }

    #[test]
    fn test_parse_rejects_bad_descriptors() {
        let err = ConnectionSpec::parse("not-a-url").unwrap_err();
        assert!(err.is_invalid_configuration());
        assert_eq!(err.short_msg(), "DescriptorMalformed");

        let err = ConnectionSpec::parse("postgres://pl-1:2379").unwrap_err();
        assert!(err.is_invalid_configuration());
        assert_eq!(err.short_msg(), "DescriptorSchemeMismatch");

        let err = ConnectionSpec::parse("meridian://?disableGC=true").unwrap_err();
        assert_eq!(err.short_msg(), "DescriptorMissingEndpoints");

        let err = ConnectionSpec::parse("meridian://pl-1:2379?disableGC=yes").unwrap_err();
        assert_eq!(err.short_msg(), "InvalidDisableGcFlag");
    }

    #[test]
    fn test_display_round_trips() -> anyhow::Result<()> {
        let spec = ConnectionSpec::parse("meridian://pl-1:2379,pl-2:2379?disableGC=true")?;
        assert_eq!(ConnectionSpec::parse(&spec.to_string())?, spec);
        Ok(())
    }
}
