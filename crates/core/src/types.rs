/// Content identifier of a stored image, as issued by the backend.
pub type ImageHash = String;

/// Opaque per-image job reference returned at dispatch time.
pub type JobRef = String;
