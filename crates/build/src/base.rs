use std::fmt;

use url::Url;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StrategyTag {
    Libguestfs,
    Layer,
    Simple,
}

impl StrategyTag {
    pub fn parse(tag: &str) -> Result<StrategyTag> {
        match tag {
            "libguestfs" => Ok(StrategyTag::Libguestfs),
            "layer" => Ok(StrategyTag::Layer),
            "simple" => Ok(StrategyTag::Simple),
            other => Err(Error::UnsupportedImageType(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyTag::Libguestfs => "libguestfs",
            StrategyTag::Layer => "layer",
            StrategyTag::Simple => "simple",
        }
    }
}

/// Where an image's base comes from, as written in the `base` property.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BaseReference {
    pub tag: StrategyTag,
    pub locator: String,
}

impl fmt::Display for BaseReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.tag.as_str(), self.locator)
    }
}

/// How a base locator relates to the rest of the build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BaseSource {
    /// A generator template, a URL or a filesystem path outside the build.
    External,
    /// The id of another spec whose output is the base.
    Spec(String),
}

impl BaseReference {
    pub fn parse(base: &str) -> Result<BaseReference> {
        let Some((tag, locator)) = base.split_once(':') else {
            return Err(Error::InvalidBaseReference(base.to_string()));
        };
        if locator.is_empty() {
            return Err(Error::InvalidBaseReference(base.to_string()));
        }
        Ok(BaseReference {
            tag: StrategyTag::parse(tag)?,
            locator: locator.to_string(),
        })
    }

    pub fn is_url(&self) -> bool {
        is_url(&self.locator)
    }

    pub fn source(&self) -> BaseSource {
        if self.tag == StrategyTag::Libguestfs
            || self.is_url()
            || self.locator.contains(std::path::MAIN_SEPARATOR)
            || self.locator.contains('/')
            || self.locator.starts_with('.')
        {
            BaseSource::External
        } else {
            BaseSource::Spec(self.locator.clone())
        }
    }
}

pub fn is_url(locator: &str) -> bool {
    Url::parse(locator)
        .map(|url| matches!(url.scheme(), "http" | "https"))
        .unwrap_or(false)
}
