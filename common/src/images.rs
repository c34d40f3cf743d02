//! Image externalizer – catalogs image URLs referenced by a recording,
//! embeds their content as data URIs, and puts them back before replay so
//! a replayed session never depends on the asset host being reachable.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde_json::Value;
use tracing::debug;

use crate::recording::{ImageData, Recording};
use crate::tree;

/// Something that can retrieve the bytes behind an image reference.
#[async_trait]
pub trait AssetFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>>;
}

/// Image type of a reference, inferred from its extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageType {
    Png,
    Jpg,
}

impl ImageType {
    pub fn from_ref(s: &str) -> Option<Self> {
        if s.ends_with(".png") {
            Some(ImageType::Png)
        } else if s.ends_with(".jpg") {
            Some(ImageType::Jpg)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ImageType::Png => "png",
            ImageType::Jpg => "jpg",
        }
    }
}

/// `true` for strings that look like an image URL: absolute (`http…`) or
/// root-relative (`/…`), at least one character, then `.png` or `.jpg`.
pub fn is_image_ref(s: &str) -> bool {
    let prefix = if s.starts_with("http") {
        "http".len()
    } else if s.starts_with('/') {
        1
    } else {
        return false;
    };
    ImageType::from_ref(s).is_some() && s.len() > prefix + ".png".len()
}

/// Build the data URI embedding `bytes` for the reference `key`.
pub fn data_uri(key: &str, bytes: &[u8]) -> Option<String> {
    let kind = ImageType::from_ref(key)?;
    Some(format!(
        "data:image/{};base64,{}",
        kind.as_str(),
        STANDARD.encode(bytes)
    ))
}

/// Add every image reference found in the scanned subtrees to
/// `recording.images` as a pending entry.  Entries that already carry a
/// data URI are left alone.  Returns the number of distinct keys.
pub fn catalog(recording: &mut Recording) -> usize {
    let mut found = Vec::new();
    for tree in recording.scanned_trees() {
        found.extend(tree::string_leaves(tree, is_image_ref).into_iter().map(String::from));
    }
    for key in found {
        recording.images.entry(key).or_insert_with(ImageData::pending);
    }
    recording.images.len()
}

/// Catalog the recording's image references and embed every pending one.
///
/// All fetches run concurrently; the catalog is updated only once every
/// fetch has succeeded, and the first failure aborts the pass.  Returns the
/// number of images fetched.
pub async fn externalize(recording: &mut Recording, fetcher: &dyn AssetFetcher) -> Result<usize> {
    catalog(recording);

    let pending: Vec<String> = recording
        .images
        .iter()
        .filter(|(_, data)| data.data_uri().is_none())
        .map(|(key, _)| key.clone())
        .collect();

    let fetches = pending.iter().map(|key| async move {
        let bytes = fetcher
            .fetch(key)
            .await
            .with_context(|| format!("Cannot fetch image {key}"))?;
        debug!("Fetched {key} ({} bytes)", bytes.len());
        let uri = data_uri(key, &bytes)
            .with_context(|| format!("Unsupported image type: {key}"))?;
        Ok::<_, anyhow::Error>((key.clone(), uri))
    });
    let embedded: BTreeMap<String, String> = futures::future::try_join_all(fetches)
        .await?
        .into_iter()
        .collect();

    let count = embedded.len();
    for (key, uri) in embedded {
        recording.images.insert(key, ImageData::Inline(uri));
    }
    Ok(count)
}

/// Replace every leaf string equal to a cataloged key with its data URI.
///
/// Running it twice is a no-op the second time since the leaves then hold
/// data URIs, which never look like keys.  Returns the number of replaced
/// leaves.
pub fn inline(recording: &mut Recording) -> usize {
    let uris: BTreeMap<String, String> = recording
        .images
        .iter()
        .filter_map(|(key, data)| Some((key.clone(), data.data_uri()?.to_string())))
        .collect();
    if uris.is_empty() {
        return 0;
    }

    let mut replaced = 0;
    for tree in recording.scanned_trees_mut() {
        tree::for_each_leaf_mut(tree, |leaf| {
            let Value::String(s) = leaf else { return };
            if let Some(uri) = uris.get(s.as_str()) {
                *s = uri.clone();
                replaced += 1;
            }
        });
    }
    replaced
}
