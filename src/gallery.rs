use crate::{model::GeneratedImage, state::RequestToken};
use anyhow::{Context, Result};
use log::warn;
use std::{
    fs,
    path::{Path, PathBuf},
};

/// One slot in the rendered grid.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GalleryEntry<'a> {
    Placeholder { index: usize },
    Realized(&'a GeneratedImage),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct PendingBatch {
    token: RequestToken,
    count: usize,
}

/// Realized images, newest batch first, plus the placeholders of the
/// request currently in flight.
#[derive(Clone, Debug, Default)]
pub struct Gallery {
    images: Vec<GeneratedImage>,
    pending: Option<PendingBatch>,
}

impl Gallery {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn begin(&mut self, token: RequestToken, count: usize) {
        self.pending = Some(PendingBatch { token, count });
    }

    /// Prepends a finished batch. Placeholders are only dropped when the
    /// batch belongs to the pending request.
    pub(crate) fn complete(&mut self, token: RequestToken, images: Vec<GeneratedImage>) {
        if let Some(pending) = self.pending {
            if pending.token == token && images.len() < pending.count {
                warn!(
                    "request {token} asked for {} images but received {}",
                    pending.count,
                    images.len()
                );
            }
        }
        self.release(token);
        self.images.splice(0..0, images);
    }

    pub(crate) fn abandon(&mut self, token: RequestToken) {
        self.release(token);
    }

    fn release(&mut self, token: RequestToken) {
        if self.pending.map(|pending| pending.token) == Some(token) {
            self.pending = None;
        }
    }

    pub(crate) fn clear(&mut self) {
        self.images.clear();
    }

    pub fn placeholder_count(&self) -> usize {
        self.pending.map(|pending| pending.count).unwrap_or(0)
    }

    pub fn images(&self) -> &[GeneratedImage] {
        &self.images
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty() && self.pending.is_none()
    }

    /// Placeholders first, then realized images in display order.
    pub fn entries(&self) -> Vec<GalleryEntry<'_>> {
        (0..self.placeholder_count())
            .map(|index| GalleryEntry::Placeholder { index })
            .chain(self.images.iter().map(GalleryEntry::Realized))
            .collect()
    }

    pub fn find(&self, filename: &str) -> Option<&GeneratedImage> {
        self.images.iter().find(|image| image.filename() == filename)
    }

    pub fn download(&self, filename: &str) -> Option<DownloadBlob> {
        self.find(filename).map(DownloadBlob::from_image)
    }
}

/// A standalone copy of one image, ready to be handed to the user.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DownloadBlob {
    pub file_name: String,
    pub mime: &'static str,
    pub bytes: Vec<u8>,
}

impl DownloadBlob {
    pub fn from_image(image: &GeneratedImage) -> Self {
        Self {
            file_name: sanitize_file_name(image.filename()),
            mime: mime_for(image.filename()),
            bytes: image.bytes().to_vec(),
        }
    }

    pub fn save_to(&self, dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create download directory {dir:?}"))?;
        let path = dir.join(&self.file_name);
        fs::write(&path, &self.bytes)
            .with_context(|| format!("failed to write image to {path:?}"))?;
        Ok(path)
    }
}

fn mime_for(file_name: &str) -> &'static str {
    let extension = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        _ => "image/png",
    }
}

fn sanitize_file_name(name: &str) -> String {
    let sanitized = name
        .chars()
        .map(|ch| match ch {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            _ if ch.is_control() => '_',
            _ => ch,
        })
        .collect::<String>();
    if sanitized.trim_matches(|c| c == '_' || c == '.').is_empty() {
        "image.png".to_string()
    } else {
        sanitized
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(name: &str) -> GeneratedImage {
        GeneratedImage::new(name, format!("/outputs/{name}"), name.as_bytes().to_vec())
    }

    fn names(gallery: &Gallery) -> Vec<&str> {
        gallery.images().iter().map(|i| i.filename()).collect()
    }

    #[test]
    fn placeholders_lead_the_entries_while_pending() {
        let mut gallery = Gallery::new();
        gallery.complete(RequestToken(1), vec![image("old.png")]);
        gallery.begin(RequestToken(2), 3);

        let entries = gallery.entries();
        assert_eq!(entries.len(), 4);
        assert_eq!(entries[2], GalleryEntry::Placeholder { index: 2 });
        assert!(matches!(entries[3], GalleryEntry::Realized(img) if img.filename() == "old.png"));
    }

    #[test]
    fn new_batches_are_prepended_in_order() {
        let mut gallery = Gallery::new();
        gallery.complete(RequestToken(1), vec![image("a.png"), image("b.png")]);
        gallery.begin(RequestToken(2), 2);
        gallery.complete(RequestToken(2), vec![image("c.png"), image("d.png")]);

        assert_eq!(names(&gallery), ["c.png", "d.png", "a.png", "b.png"]);
        assert_eq!(gallery.placeholder_count(), 0);
    }

    #[test]
    fn short_batch_drops_leftover_placeholders() {
        let mut gallery = Gallery::new();
        gallery.begin(RequestToken(4), 4);
        gallery.complete(RequestToken(4), vec![image("only.png")]);
        assert_eq!(gallery.placeholder_count(), 0);
        assert_eq!(gallery.len(), 1);
    }

    #[test]
    fn stale_token_keeps_current_placeholders() {
        let mut gallery = Gallery::new();
        gallery.begin(RequestToken(8), 2);
        gallery.abandon(RequestToken(7));
        assert_eq!(gallery.placeholder_count(), 2);
        gallery.abandon(RequestToken(8));
        assert_eq!(gallery.placeholder_count(), 0);
        assert!(gallery.is_empty());
    }

    #[test]
    fn download_copies_bytes_without_mutating() {
        let mut gallery = Gallery::new();
        gallery.complete(RequestToken(1), vec![image("fox.JPG")]);
        let blob = gallery.download("fox.JPG").unwrap();
        assert_eq!(blob.mime, "image/jpeg");
        assert_eq!(blob.bytes, b"fox.JPG");
        assert_eq!(gallery.len(), 1);
        assert!(gallery.download("missing.png").is_none());
    }

    #[test]
    fn file_names_cannot_escape_the_target_directory() {
        assert_eq!(sanitize_file_name("../../etc/passwd"), ".._.._etc_passwd");
        assert_eq!(sanitize_file_name("//"), "image.png");
    }
}
