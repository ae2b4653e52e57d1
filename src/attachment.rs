//! Image attachments for the user message.

use crate::types::ContentPart;
use crate::{Error, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use std::path::Path;

/// Prefix an image attachment argument must carry
pub const IMAGE_PREFIX: &str = "image=@";

/// Turns an `image=@<path>` argument into an inline `image_url` content part.
///
/// The file is read and embedded as a base64 `data:image/jpeg` URL.
pub fn image_part(arg: &str) -> Result<ContentPart> {
    let path = arg.strip_prefix(IMAGE_PREFIX).ok_or_else(|| {
        Error::attachment(format!(
            "{}: wrong format, expected {}<path>",
            arg, IMAGE_PREFIX
        ))
    })?;

    let path = Path::new(path);
    if !path.is_file() {
        return Err(Error::attachment(format!(
            "{}: file not found",
            path.display()
        )));
    }

    let bytes = std::fs::read(path)
        .map_err(|e| Error::attachment(format!("{}: {}", path.display(), e)))?;
    tracing::debug!(path = %path.display(), size = bytes.len(), "attaching image");

    Ok(ContentPart::image_url(format!(
        "data:image/jpeg;base64,{}",
        STANDARD.encode(bytes)
    )))
}

/// Converts every attachment argument, failing on the first bad one.
pub fn image_parts<S: AsRef<str>>(args: &[S]) -> Result<Vec<ContentPart>> {
    args.iter().map(|arg| image_part(arg.as_ref())).collect()
}
