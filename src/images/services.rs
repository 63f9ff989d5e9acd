use tracing::{info, warn};

use crate::storage::{ImageCategory, ImageStore, ImageUpload};

/// Uploads `image` as the replacement for `current`.
///
/// The old image is deleted first; a failed delete is logged and ignored.
/// Upload failures propagate.
pub async fn replace_image(
    store: &dyn ImageStore,
    current: Option<&str>,
    image: ImageUpload,
    category: ImageCategory,
) -> anyhow::Result<String> {
    if let Some(old) = current {
        match store.delete(old).await {
            Ok(()) => info!(public_ref = %old, category = category.as_str(), "old image deleted"),
            Err(e) => warn!(error = %e, public_ref = %old, "old image delete failed; continuing"),
        }
    }
    let public_ref = store.upload(image, category).await?;
    info!(public_ref = %public_ref, category = category.as_str(), "image uploaded");
    Ok(public_ref)
}

/// Best-effort removal of images uploaded by a workflow that then failed.
pub async fn discard_uploaded(store: &dyn ImageStore, refs: &[String]) {
    for r in refs {
        if let Err(e) = store.delete(r).await {
            warn!(error = %e, public_ref = %r, "orphaned image cleanup failed");
        }
    }
}
