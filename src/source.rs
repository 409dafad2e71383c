// SPDX-License-Identifier: MPL-2.0

//! Player inputs: where the AVIF bytes come from and where frames go.

use std::{cell::Cell, fmt, path::Path, rc::Rc};

use calloop::{LoopHandle, channel};
use tracing::{debug, info};

use crate::{
    error::{ConfigurationError, FetchError},
    event_loop::remove_source_later,
    render::{SharedSurface, SurfaceRegistry},
};

/// The AVIF file to play.
#[derive(Clone, PartialEq, Eq)]
pub enum ImageSource {
    /// `http(s)://` or `file://` URL, or a plain filesystem path.
    Url(String),
    /// The complete file contents.
    Bytes(Vec<u8>),
}

impl ImageSource {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let empty = match self {
            ImageSource::Url(url) => url.trim().is_empty(),
            ImageSource::Bytes(bytes) => bytes.is_empty(),
        };
        if empty {
            Err(ConfigurationError::EmptyInput)
        } else {
            Ok(())
        }
    }
}

impl fmt::Debug for ImageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageSource::Url(url) => f.debug_tuple("Url").field(url).finish(),
            ImageSource::Bytes(bytes) => write!(f, "Bytes({} bytes)", bytes.len()),
        }
    }
}

impl From<String> for ImageSource {
    fn from(url: String) -> Self {
        ImageSource::Url(url)
    }
}

impl From<&str> for ImageSource {
    fn from(url: &str) -> Self {
        ImageSource::Url(url.to_string())
    }
}

impl From<Vec<u8>> for ImageSource {
    fn from(bytes: Vec<u8>) -> Self {
        ImageSource::Bytes(bytes)
    }
}

/// Surface that frames are painted onto.
#[derive(Clone)]
pub enum RenderTarget {
    /// Looked up in a [`SurfaceRegistry`] at construction.
    Id(String),
    Surface(SharedSurface),
}

impl RenderTarget {
    pub fn resolve(
        &self,
        registry: Option<&SurfaceRegistry>,
    ) -> Result<SharedSurface, ConfigurationError> {
        match self {
            RenderTarget::Surface(surface) => Ok(surface.clone()),
            RenderTarget::Id(id) if id.trim().is_empty() => Err(ConfigurationError::EmptyTargetId),
            RenderTarget::Id(id) => registry
                .and_then(|registry| registry.get(id))
                .ok_or_else(|| ConfigurationError::UnknownTarget(id.clone())),
        }
    }
}

impl fmt::Debug for RenderTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RenderTarget::Id(id) => f.debug_tuple("Id").field(id).finish(),
            RenderTarget::Surface(surface) => {
                write!(f, "Surface({:?})", surface.borrow().size())
            }
        }
    }
}

impl From<&str> for RenderTarget {
    fn from(id: &str) -> Self {
        RenderTarget::Id(id.to_string())
    }
}

impl From<SharedSurface> for RenderTarget {
    fn from(surface: SharedSurface) -> Self {
        RenderTarget::Surface(surface)
    }
}

/// Read the complete resource behind `url`. Blocking.
pub fn fetch(url: &str) -> Result<Vec<u8>, FetchError> {
    let bytes = if url.starts_with("http://") || url.starts_with("https://") {
        fetch_http(url)?
    } else {
        let path = url.strip_prefix("file://").unwrap_or(url);
        read_file(Path::new(path))?
    };

    if bytes.is_empty() {
        return Err(FetchError::Empty(url.to_string()));
    }
    Ok(bytes)
}

fn read_file(path: &Path) -> Result<Vec<u8>, FetchError> {
    std::fs::read(path).map_err(|err| FetchError::Read {
        path: path.display().to_string(),
        reason: err.to_string(),
    })
}

#[cfg(feature = "http")]
fn fetch_http(url: &str) -> Result<Vec<u8>, FetchError> {
    let http = |err: reqwest::Error| FetchError::Http {
        url: url.to_string(),
        reason: err.to_string(),
    };
    let response = reqwest::blocking::get(url)
        .and_then(reqwest::blocking::Response::error_for_status)
        .map_err(http)?;
    Ok(response.bytes().map_err(http)?.to_vec())
}

#[cfg(not(feature = "http"))]
fn fetch_http(url: &str) -> Result<Vec<u8>, FetchError> {
    Err(FetchError::Unsupported(url.to_string()))
}

/// Fetch `url` on a helper thread and hand the result to `on_done` on the
/// loop thread.
pub(crate) fn spawn_fetch<D: 'static>(
    handle: &LoopHandle<'static, D>,
    url: String,
    on_done: impl FnOnce(Result<Vec<u8>, FetchError>) + 'static,
) -> Result<(), calloop::Error> {
    let (tx, rx) = channel::channel();
    let mut on_done = Some(on_done);
    let remover = handle.clone();
    let token = Rc::new(Cell::new(None));
    let registered = token.clone();

    let inserted = handle
        .insert_source(rx, move |event, _, _| {
            if let channel::Event::Msg(result) = event {
                if let Some(on_done) = on_done.take() {
                    on_done(result);
                }
            }
            if let Some(token) = registered.take() {
                remove_source_later(&remover, token);
            }
        })
        .map_err(|err| err.error)?;
    token.set(Some(inserted));

    debug!(%url, "fetching");
    std::thread::Builder::new()
        .name("avif-fetch".to_string())
        .spawn(move || {
            let result = fetch(&url);
            if let Ok(bytes) = &result {
                info!(%url, bytes = bytes.len(), "fetched");
            }
            let _ = tx.send(result);
        })
        .map_err(calloop::Error::IoError)?;
    Ok(())
}
