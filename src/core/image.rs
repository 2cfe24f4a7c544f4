use reqwest::Url;
use sha2::{Digest, Sha256};

use crate::errors::{ProviderError, ProviderResult};

pub const ISO_CONTENT: &str = "iso";
const IMAGE_FLAVOR: &str = "nocloud-amd64.iso";

/// Factory download URL for a schematic/version pair:
/// `<factory>/image/<schematic>/<version>/nocloud-amd64.iso`.
pub fn image_url(factory: &str, schematic: &str, talos_version: &str) -> ProviderResult<Url> {
    let mut url = Url::parse(factory).map_err(|e| {
        ProviderError::Schematic(format!("invalid image factory URL {factory:?}: {e}"))
    })?;

    url.path_segments_mut()
        .map_err(|_| ProviderError::Schematic(format!("image factory URL {factory:?} cannot be a base")))?
        .pop_if_empty()
        .extend(["image", schematic, talos_version, IMAGE_FLAVOR]);

    Ok(url)
}

/// Content-addressed name the ISO is cached under on the node. Anything
/// changing the URL yields a different file.
pub fn image_file_name(url: &Url) -> String {
    let digest = Sha256::digest(url.as_str().as_bytes());
    format!("{}.iso", hex::encode(digest))
}

#[cfg(test)]
mod tests {
    use super::*;

    const FACTORY: &str = "https://factory.talos.dev";
    const SCHEMATIC: &str = "376567988ad370138ad8b2698212367b8edcb69b5fd68c80be1f2ec7d603b4ba";

    #[test]
    fn test_image_url() {
        let url = image_url(FACTORY, SCHEMATIC, "v1.9.0").unwrap();
        assert_eq!(
            url.as_str(),
            format!("https://factory.talos.dev/image/{SCHEMATIC}/v1.9.0/nocloud-amd64.iso")
        );

        // trailing slash on the base does not double up
        let url = image_url("https://factory.example/", "abc", "v1.8.3").unwrap();
        assert_eq!(url.as_str(), "https://factory.example/image/abc/v1.8.3/nocloud-amd64.iso");
    }

    #[test]
    fn test_file_name_is_sha256_of_url() {
        let url = image_url(FACTORY, SCHEMATIC, "v1.9.0").unwrap();
        let name = image_file_name(&url);

        let expected = hex::encode(Sha256::digest(url.as_str().as_bytes()));
        assert_eq!(name, format!("{expected}.iso"));
        assert_eq!(name.len(), 64 + 4);
        assert!(name[..64].chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_file_name_is_deterministic() {
        let a = image_file_name(&image_url(FACTORY, SCHEMATIC, "v1.9.0").unwrap());
        let b = image_file_name(&image_url(FACTORY, SCHEMATIC, "v1.9.0").unwrap());
        assert_eq!(a, b);

        let other_version = image_file_name(&image_url(FACTORY, SCHEMATIC, "v1.9.1").unwrap());
        let other_schematic = image_file_name(&image_url(FACTORY, "abc", "v1.9.0").unwrap());
        assert_ne!(a, other_version);
        assert_ne!(a, other_schematic);
    }

    #[test]
    fn test_invalid_factory() {
        assert!(image_url("factory without scheme", SCHEMATIC, "v1.9.0").is_err());
    }
}
