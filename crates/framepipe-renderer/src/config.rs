use std::path::{Path, PathBuf};

use framepipe_channel::{ChannelConfig, Geometry, PixelFormat};
use serde::{Deserialize, Serialize};

use crate::error::{RendererError, Result};

/// Default surface width in pixels (portrait phone panel).
pub const DEFAULT_WIDTH: u32 = 1080;
/// Default surface height in pixels.
pub const DEFAULT_HEIGHT: u32 = 1920;

/// File name probed in each native search directory.
pub const NATIVE_LIBRARY_NAME: &str = "libfprender.so";

/// Which backend variant a renderer is built around.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Stub,
    Native,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stub => "stub",
            Self::Native => "native",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BackendKind {
    type Err = RendererError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "stub" => Ok(Self::Stub),
            "native" => Ok(Self::Native),
            other => Err(RendererError::InvalidArgument(format!(
                "unknown backend {other:?} (expected stub or native)"
            ))),
        }
    }
}

/// Display rotation, clockwise. Serialized as degrees.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum Rotation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Rotation {
    pub fn degrees(self) -> u32 {
        match self {
            Self::Deg0 => 0,
            Self::Deg90 => 90,
            Self::Deg180 => 180,
            Self::Deg270 => 270,
        }
    }

    /// Quarter turns swap the source image's axes.
    pub fn swaps_axes(self) -> bool {
        matches!(self, Self::Deg90 | Self::Deg270)
    }
}

impl TryFrom<u32> for Rotation {
    type Error = RendererError;

    fn try_from(degrees: u32) -> Result<Self> {
        match degrees {
            0 => Ok(Self::Deg0),
            90 => Ok(Self::Deg90),
            180 => Ok(Self::Deg180),
            270 => Ok(Self::Deg270),
            other => Err(RendererError::InvalidArgument(format!(
                "rotation must be 0, 90, 180 or 270 (got {other})"
            ))),
        }
    }
}

impl From<Rotation> for u32 {
    fn from(rotation: Rotation) -> Self {
        rotation.degrees()
    }
}

impl std::fmt::Display for Rotation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.degrees())
    }
}

/// Native backend parameters.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NativeConfig {
    /// Explicit library path (or bare soname), tried before the search path.
    pub library_path: Option<PathBuf>,
    /// Directories probed for [`NATIVE_LIBRARY_NAME`], in order.
    pub search_paths: Vec<PathBuf>,
}

impl Default for NativeConfig {
    fn default() -> Self {
        Self {
            library_path: None,
            search_paths: vec![
                PathBuf::from("/usr/local/lib/framepipe"),
                PathBuf::from("/usr/lib/framepipe"),
            ],
        }
    }
}

impl NativeConfig {
    /// Candidate library locations in load order.
    pub fn candidates(&self) -> Vec<PathBuf> {
        self.library_path
            .iter()
            .cloned()
            .chain(
                self.search_paths
                    .iter()
                    .map(|dir| dir.join(NATIVE_LIBRARY_NAME)),
            )
            .collect()
    }
}

/// Where frames are published.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ChannelSettings {
    /// Segment name; defaults to `/framepipe-<pid>`.
    pub name: Option<String>,
    /// Publish to an in-process anonymous segment instead of a named one.
    pub anonymous: bool,
}

impl ChannelSettings {
    pub fn channel_config(&self) -> ChannelConfig {
        if self.anonymous {
            ChannelConfig::default()
        } else {
            ChannelConfig::named(
                self.name
                    .clone()
                    .unwrap_or_else(ChannelConfig::default_name),
            )
        }
    }
}

/// Renderer configuration, loadable from JSON.
///
/// ```json
/// { "backend": "stub", "width": 1080, "height": 1920, "rotation": 0 }
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RendererConfig {
    pub backend: BackendKind,
    pub width: u32,
    pub height: u32,
    pub rotation: Rotation,
    pub format: PixelFormat,
    /// Render device node, e.g. `/dev/dri/renderD128`. Checked at
    /// initialization and before every batch, whatever the backend.
    pub device_node: Option<PathBuf>,
    pub native: NativeConfig,
    pub channel: ChannelSettings,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Stub,
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            rotation: Rotation::Deg0,
            format: PixelFormat::Bgra8888,
            device_node: None,
            native: NativeConfig::default(),
            channel: ChannelSettings::default(),
        }
    }
}

impl RendererConfig {
    /// Stub renderer publishing to an anonymous channel.
    pub fn stub(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            channel: ChannelSettings {
                name: None,
                anonymous: true,
            },
            ..Self::default()
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| RendererError::ConfigRead {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&text)
    }

    /// Check dimensions and derive the surface geometry.
    pub fn validate(&self) -> Result<Geometry> {
        if let Some(name) = &self.channel.name {
            framepipe_shm::validate_name(name)
                .map_err(|err| RendererError::InvalidArgument(err.to_string()))?;
        }
        geometry(self.width, self.height, self.format)
    }
}

/// Validated geometry, with channel errors reported as invalid arguments.
pub(crate) fn geometry(width: u32, height: u32, format: PixelFormat) -> Result<Geometry> {
    Geometry::new(width, height, format)
        .map_err(|err| RendererError::InvalidArgument(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_phone_panel() {
        let config = RendererConfig::default();
        assert_eq!((config.width, config.height), (1080, 1920));
        assert_eq!(config.backend, BackendKind::Stub);
        assert_eq!(config.rotation, Rotation::Deg0);
        assert_eq!(config.format, PixelFormat::Bgra8888);
        assert!(!config.channel.anonymous);
    }

    #[test]
    fn parses_partial_json_with_defaults() {
        let config = RendererConfig::from_json_str(
            r#"{"backend":"native","width":540,"rotation":270,"device_node":"/dev/dri/renderD128",
                "native":{"library_path":"/opt/gl/libfprender.so"}}"#,
        )
        .unwrap();
        assert_eq!(config.backend, BackendKind::Native);
        assert_eq!(config.width, 540);
        assert_eq!(config.height, DEFAULT_HEIGHT);
        assert_eq!(config.rotation, Rotation::Deg270);
        assert_eq!(
            config.device_node.as_deref(),
            Some(Path::new("/dev/dri/renderD128"))
        );
        assert_eq!(
            config.native.candidates()[0],
            PathBuf::from("/opt/gl/libfprender.so")
        );
        assert_eq!(config.native.candidates().len(), 3);
    }

    #[test]
    fn rejects_bad_rotation_and_unknown_fields() {
        assert!(RendererConfig::from_json_str(r#"{"rotation":45}"#).is_err());
        assert!(RendererConfig::from_json_str(r#"{"vsync":true}"#).is_err());
        assert!(matches!(
            Rotation::try_from(360),
            Err(RendererError::InvalidArgument(_))
        ));
    }

    #[test]
    fn validate_rejects_zero_dimensions_and_bad_names() {
        let mut config = RendererConfig::stub(0, 10);
        assert!(matches!(
            config.validate(),
            Err(RendererError::InvalidArgument(_))
        ));

        config.width = 10;
        config.channel.name = Some("no-slash".into());
        assert!(config.validate().is_err());

        config.channel.name = Some(format!("/{}", "a".repeat(300)));
        assert!(matches!(
            config.validate(),
            Err(RendererError::InvalidArgument(_))
        ));

        config.channel.name = Some("/ok".into());
        let geometry = config.validate().unwrap();
        assert_eq!(geometry.stride(), 40);
    }

    #[test]
    fn channel_settings_resolve_name() {
        let named = ChannelSettings::default().channel_config();
        assert_eq!(named.name, Some(ChannelConfig::default_name()));

        let anonymous = ChannelSettings {
            name: Some("/ignored".into()),
            anonymous: true,
        };
        assert!(anonymous.channel_config().name.is_none());
    }
}
