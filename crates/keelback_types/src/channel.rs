use std::{
    fmt::{self, Display, Formatter},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::{utils::url::add_trailing_slash, Platform};

/// Configuration needed to resolve bare channel names to URLs.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ChannelConfig {
    /// The base url that named channels are resolved against, e.g.
    /// `conda-forge` becomes `<alias>/conda-forge`.
    pub channel_alias: Url,

    /// The directory relative filesystem channels are resolved against.
    pub root_dir: PathBuf,
}

impl ChannelConfig {
    /// The default configuration: names resolve against anaconda.org,
    /// relative paths against the given directory.
    pub fn default_with_root_dir(root_dir: PathBuf) -> Self {
        Self {
            channel_alias: Url::parse("https://conda.anaconda.org/")
                .expect("the default channel alias is a valid url"),
            root_dir,
        }
    }
}

/// A source of packages: a base URL under which one repodata file per subdir
/// is published.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Channel {
    /// The name of the channel when it was created from a name or an alias
    /// url; used for display and for channel-matching in specs.
    pub name: Option<String>,

    /// The base url of the channel, always ending in a slash.
    pub base_url: Url,
}

/// The error returned when a channel string cannot be resolved.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum ParseChannelError {
    /// The string is neither a url, a path, nor a valid channel name.
    #[error("'{0}' is not a valid channel url, path, or name")]
    InvalidName(String),

    /// The string looks like a url but does not parse as one.
    #[error("invalid channel url '{0}'")]
    InvalidUrl(String),

    /// A filesystem channel path could not be converted to a url.
    #[error("invalid channel path '{0}'")]
    InvalidPath(String),
}

impl Channel {
    /// Resolves a channel from a string: a full url, an absolute or relative
    /// filesystem path, or a bare name resolved against the channel alias.
    pub fn from_str(
        source: impl AsRef<str>,
        config: &ChannelConfig,
    ) -> Result<Self, ParseChannelError> {
        let source = source.as_ref().trim().trim_end_matches('/');
        if source.is_empty() {
            return Err(ParseChannelError::InvalidName(source.to_owned()));
        }

        if source.contains("://") {
            let url = Url::parse(&format!("{source}/"))
                .map_err(|_| ParseChannelError::InvalidUrl(source.to_owned()))?;
            let name = channel_name_from_alias(&url, &config.channel_alias);
            return Ok(Channel {
                name,
                base_url: url,
            });
        }

        if source.starts_with('/') || source.starts_with("./") || source.starts_with("../") {
            let path = if Path::new(source).is_absolute() {
                PathBuf::from(source)
            } else {
                config.root_dir.join(source)
            };
            let url = Url::from_directory_path(&path)
                .map_err(|()| ParseChannelError::InvalidPath(source.to_owned()))?;
            return Ok(Channel {
                name: None,
                base_url: url,
            });
        }

        // A bare name; may carry a subdir suffix (`conda-forge/label/dev` is
        // still a name, platform suffixes are stripped by the caller).
        if source
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, ':' | '\\'))
        {
            return Err(ParseChannelError::InvalidName(source.to_owned()));
        }

        let base_url = config
            .channel_alias
            .join(&format!("{source}/"))
            .map_err(|_| ParseChannelError::InvalidName(source.to_owned()))?;
        Ok(Channel {
            name: Some(source.to_owned()),
            base_url,
        })
    }

    /// Constructs a channel directly from a base url.
    pub fn from_url(url: Url) -> Self {
        Channel {
            name: None,
            base_url: add_trailing_slash(&url),
        }
    }

    /// The name of the channel, falling back to the base url.
    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or_else(|| self.base_url.as_str())
    }

    /// The identifier recorded in package records: the full url without a
    /// trailing slash.
    pub fn canonical_name(&self) -> String {
        self.base_url.as_str().trim_end_matches('/').to_owned()
    }

    /// The url of a subdir of this channel, e.g. `<base>/linux-64/`.
    pub fn platform_url(&self, platform: Platform) -> Url {
        self.base_url
            .join(&format!("{platform}/"))
            .expect("platform slugs always form valid url segments")
    }
}

impl Display for Channel {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Derives the short channel name when the url lives under the alias, so
/// `https://conda.anaconda.org/conda-forge/` displays as `conda-forge`.
fn channel_name_from_alias(url: &Url, alias: &Url) -> Option<String> {
    let relative = alias.make_relative(url)?;
    let name = relative.trim_end_matches('/');
    if name.is_empty() || name.contains("..") {
        None
    } else {
        Some(name.to_owned())
    }
}
