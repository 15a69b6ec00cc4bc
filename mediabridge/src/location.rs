//! Upstream locations and document metadata.
use async_trait::async_trait;

use crate::hash::short_hash;

/// Where a media object lives upstream.
///
/// The platform addresses documents and photo thumbnails differently,
/// but the cache and the fetch layer only ever need the uniform
/// [`location_id`](Location::location_id) projection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    /// A document (file, video, audio).
    Document {
        /// Upstream document id.
        id: i64,
        /// Access hash paired with the id.
        access_hash: i64,
        /// Opaque reference the upstream hands out per message.
        file_reference: Vec<u8>,
    },
    /// A sized thumbnail of a photo.
    PhotoThumb {
        /// Upstream photo id.
        id: i64,
        /// Access hash paired with the id.
        access_hash: i64,
        /// Opaque reference the upstream hands out per message.
        file_reference: Vec<u8>,
        /// Which thumbnail size to fetch.
        thumb_type: String,
    },
}

impl Location {
    /// The stable 64-bit identifier of the underlying object. Distinct
    /// media never share one.
    #[must_use]
    pub fn location_id(&self) -> i64 {
        match self {
            Self::Document { id, .. } | Self::PhotoThumb { id, .. } => *id,
        }
    }
}

/// Metadata of a streamable document resolved from a message.
#[derive(Debug, Clone)]
pub struct DocumentFile {
    /// Upstream document id.
    pub id: i64,
    /// Where to fetch the bytes from.
    pub location: Location,
    /// Total size in bytes.
    pub size: u64,
    /// Content type reported by the platform.
    pub mime_type: mime::Mime,
    /// File name reported by the platform.
    pub file_name: String,
}

impl DocumentFile {
    /// The URL authentication token for this document, derived from its
    /// metadata. Compared byte for byte; treat it as opaque.
    #[must_use]
    pub fn url_hash(&self, hash_length: usize) -> String {
        short_hash(
            &self.file_name,
            self.size,
            self.mime_type.as_ref(),
            self.id,
            hash_length,
        )
    }
}

/// Collaborator that turns a message id into a [`DocumentFile`].
///
/// Implemented by the platform client outside this crate.
#[async_trait]
pub trait MediaResolver: Send + Sync {
    /// Look the message up and describe its media.
    ///
    /// # Errors
    ///
    /// [`Error::MessageNotFound`](crate::errors::Error::MessageNotFound)
    /// if the message doesn't exist or has nothing streamable attached.
    async fn resolve(&self, message_id: i64) -> crate::Result<DocumentFile>;
}

#[cfg(test)]
mod tests {
    use super::Location;

    #[test]
    fn location_id_is_uniform_across_variants() {
        let document = Location::Document {
            id: 42,
            access_hash: 7,
            file_reference: vec![1, 2, 3],
        };
        let thumb = Location::PhotoThumb {
            id: 42,
            access_hash: 9,
            file_reference: vec![],
            thumb_type: "m".into(),
        };

        assert_eq!(document.location_id(), 42);
        assert_eq!(thumb.location_id(), 42);
    }
}
