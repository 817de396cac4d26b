use std::{
    fmt,
    path::{Path, PathBuf},
    sync::OnceLock,
};

use indexmap::IndexMap;
use log::debug;
use regex::Regex;
use tokio::fs;

use crate::{
    base::BaseReference,
    error::{Error, Result},
};

fn property_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r"^#(?P<key>[^\s=]+)\s*=\s*(?P<value>.*?)\s*$").expect("property regex is valid")
    })
}

/// Repository format a spec is validated against.
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq, Hash)]
pub enum SpecFormat {
    Lago,
    VirtBuilder,
    #[default]
    All,
}

impl SpecFormat {
    pub fn required_properties(&self) -> &'static [&'static str] {
        match self {
            SpecFormat::Lago => &["name", "base", "distro"],
            SpecFormat::VirtBuilder => &["name", "base", "osinfo", "arch", "expand"],
            SpecFormat::All => &["name", "base", "distro", "osinfo", "arch", "expand"],
        }
    }

    pub fn includes_lago(&self) -> bool {
        matches!(self, SpecFormat::Lago | SpecFormat::All)
    }

    pub fn includes_virt_builder(&self) -> bool {
        matches!(self, SpecFormat::VirtBuilder | SpecFormat::All)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SpecProperties {
    pub name: Option<String>,
    pub base: Option<String>,
    pub distro: Option<String>,
    pub osinfo: Option<String>,
    pub arch: Option<String>,
    pub expand: Option<String>,
    pub version: Option<String>,
    pub meta_data_only: bool,
    pub extra: IndexMap<String, String>,
}

impl SpecProperties {
    pub fn parse(content: &str) -> SpecProperties {
        let mut properties = SpecProperties::default();
        for line in content.lines() {
            let Some(captures) = property_regex().captures(line) else {
                continue;
            };
            properties.set(&captures["key"], captures["value"].to_string());
        }
        properties
    }

    pub fn set(&mut self, key: &str, value: String) {
        match key {
            "name" => self.name = Some(value),
            "base" => self.base = Some(value),
            "distro" => self.distro = Some(value),
            "osinfo" => self.osinfo = Some(value),
            "arch" => self.arch = Some(value),
            "expand" => self.expand = Some(value),
            "version" => self.version = Some(value),
            "meta_data_only" => {
                self.meta_data_only = !matches!(
                    value.to_ascii_lowercase().as_str(),
                    "" | "0" | "false" | "no"
                )
            }
            _ => {
                self.extra.insert(key.to_string(), value);
            }
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        match key {
            "name" => self.name.is_some(),
            "base" => self.base.is_some(),
            "distro" => self.distro.is_some(),
            "osinfo" => self.osinfo.is_some(),
            "arch" => self.arch.is_some(),
            "expand" => self.expand.is_some(),
            "version" => self.version.is_some(),
            "meta_data_only" => self.meta_data_only,
            other => self.extra.contains_key(other),
        }
    }
}

/// Values measured while building. Each one is written once per build.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BuildRecord {
    pub size: Option<u64>,
    pub sha1: Option<String>,
    pub uncompressed_checksum: Option<String>,
    pub compressed_size: Option<u64>,
    pub compressed_sha1: Option<String>,
    pub checksum: Option<String>,
    pub timestamp: Option<i64>,
}

/// Keys the build writes into the image metadata. Specs may not set them.
pub const BUILD_RECORD_KEYS: &[&str] = &[
    "size",
    "sha1",
    "uncompressed_checksum",
    "compressed_size",
    "compressed_sha1",
    "checksum",
    "timestamp",
];

fn record<T>(slot: &mut Option<T>, value: T, name: &'static str) -> Result<()> {
    if slot.is_some() {
        return Err(Error::PropertyAlreadySet(name));
    }
    *slot = Some(value);
    Ok(())
}

impl BuildRecord {
    pub fn record_uncompressed(&mut self, size: u64, sha1: String, sha512: String) -> Result<()> {
        record(&mut self.size, size, "size")?;
        record(&mut self.sha1, sha1, "sha1")?;
        record(&mut self.uncompressed_checksum, sha512, "uncompressed_checksum")
    }

    pub fn record_compressed(
        &mut self,
        size: u64,
        sha1: String,
        sha512: String,
        timestamp: i64,
    ) -> Result<()> {
        record(&mut self.compressed_size, size, "compressed_size")?;
        record(&mut self.compressed_sha1, sha1, "compressed_sha1")?;
        record(&mut self.checksum, sha512, "checksum")?;
        record(&mut self.timestamp, timestamp, "timestamp")
    }
}

#[derive(Clone, Debug)]
pub struct Spec {
    pub id: String,
    pub commands_file: PathBuf,
    pub properties: SpecProperties,
    pub build: BuildRecord,
}

impl Spec {
    pub fn new(
        id: impl Into<String>,
        commands_file: impl Into<PathBuf>,
        properties: SpecProperties,
        format: SpecFormat,
    ) -> Result<Spec> {
        let spec = Spec {
            id: id.into(),
            commands_file: commands_file.into(),
            properties,
            build: BuildRecord::default(),
        };
        spec.verify(format)?;
        Ok(spec)
    }

    pub fn parse(content: &str, commands_file: &Path, format: SpecFormat) -> Result<Spec> {
        let id = commands_file
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| Error::SpecNameMissing(commands_file.to_path_buf()))?;
        Spec::new(id, commands_file, SpecProperties::parse(content), format)
    }

    pub async fn load(path: &Path, format: SpecFormat) -> Result<Spec> {
        debug!("loading spec path={}", path.display());
        let content = fs::read_to_string(path).await?;
        Spec::parse(&content, path, format)
    }

    pub fn verify(&self, format: SpecFormat) -> Result<()> {
        let missing = format
            .required_properties()
            .iter()
            .filter(|key| !self.properties.contains(key))
            .map(|key| key.to_string())
            .collect::<Vec<_>>();
        if !missing.is_empty() {
            return Err(Error::MalformedSpec {
                path: self.commands_file.clone(),
                missing,
            });
        }
        if let Some(key) = self
            .properties
            .extra
            .keys()
            .find(|key| BUILD_RECORD_KEYS.contains(&key.as_str()))
        {
            return Err(Error::ReservedProperty {
                path: self.commands_file.clone(),
                key: key.clone(),
            });
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        self.properties.name.as_deref().unwrap_or(&self.id)
    }

    pub fn base(&self) -> Result<BaseReference> {
        let base = self
            .properties
            .base
            .as_deref()
            .ok_or_else(|| Error::BaseMissing(self.id.clone()))?;
        BaseReference::parse(base)
    }
}

impl fmt::Display for Spec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.commands_file.display())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const FEDORA: &str = "#name=fc23-base\n\
                          #base = libguestfs:fedora-23\n\
                          #distro=fc23\n\
                          #osinfo=Fedora 23\n\
                          #arch=x86_64\n\
                          #expand=/dev/sda3\n\
                          #root-password=password:123456\n\
                          install vim\n\
                          # a plain comment\n\
                          run-command dnf clean all\n";

    #[test]
    fn test_parse_properties() {
        let properties = SpecProperties::parse(FEDORA);
        assert_eq!(properties.name.as_deref(), Some("fc23-base"));
        assert_eq!(properties.base.as_deref(), Some("libguestfs:fedora-23"));
        assert_eq!(properties.osinfo.as_deref(), Some("Fedora 23"));
        assert_eq!(
            properties.extra.get("root-password").map(String::as_str),
            Some("password:123456")
        );
        assert_eq!(properties.extra.len(), 1);
        assert!(!properties.meta_data_only);
    }

    #[test]
    fn test_id_from_file_name() {
        let spec = Spec::parse(FEDORA, Path::new("/specs/fc23-base"), SpecFormat::All).unwrap();
        assert_eq!(spec.id, "fc23-base");
        assert_eq!(spec.commands_file, PathBuf::from("/specs/fc23-base"));
        assert_eq!(spec.name(), "fc23-base");
    }

    #[test]
    fn test_missing_required_properties() {
        let content = "#name=el7\n#base=simple:/images/el7.qcow2\n";
        assert!(Spec::parse(content, Path::new("el7"), SpecFormat::Lago).is_err());
        let error = Spec::parse(content, Path::new("el7"), SpecFormat::VirtBuilder).unwrap_err();
        match error {
            Error::MalformedSpec { missing, .. } => {
                assert_eq!(missing, vec!["osinfo", "arch", "expand"]);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_meta_data_only_flag() {
        let mut properties = SpecProperties::default();
        properties.set("meta_data_only", "True".to_string());
        assert!(properties.meta_data_only);
        properties.set("meta_data_only", "no".to_string());
        assert!(!properties.meta_data_only);
    }

    #[test]
    fn test_build_record_is_write_once() {
        let mut record = BuildRecord::default();
        record
            .record_uncompressed(10, "a".to_string(), "b".to_string())
            .unwrap();
        let error = record
            .record_uncompressed(11, "c".to_string(), "d".to_string())
            .unwrap_err();
        assert!(matches!(error, Error::PropertyAlreadySet("size")));
        assert_eq!(record.size, Some(10));
    }

    #[test]
    fn test_build_record_keys_are_rejected() {
        let content = "#name=el7\n#base=simple:/images/el7.qcow2\n#distro=el7\n#size=10G\n";
        let error = Spec::parse(content, Path::new("/specs/el7"), SpecFormat::Lago).unwrap_err();
        match error {
            Error::ReservedProperty { path, key } => {
                assert_eq!(path, PathBuf::from("/specs/el7"));
                assert_eq!(key, "size");
            }
            other => panic!("unexpected error: {}", other),
        }

        let content = "#name=el7\n#base=simple:/images/el7.qcow2\n#distro=el7\n#owner=qa\n";
        let spec = Spec::parse(content, Path::new("/specs/el7"), SpecFormat::Lago).unwrap();
        assert_eq!(spec.properties.extra.get("owner").map(String::as_str), Some("qa"));
    }
}
