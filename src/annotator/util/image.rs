/*
 * Copyright (C) 2024 The Annotator Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

const DEFAULT_TAG: &str = "latest";
const SHORT_DIGEST_LEN: usize = 7;

/// Extracts the tag portion of a container image reference.
///
/// Digest references (`repo@sha256:<hex>`) yield the first seven hex
/// characters of the digest. Otherwise the text after the last `:` that
/// follows the final `/` is returned, so registry ports are never mistaken
/// for tags. References without either form resolve to `latest`.
pub fn extract_image_tag(image: &str) -> String {
    if let Some(at) = image.rfind('@') {
        let digest = &image[at + 1..];
        return match digest.split_once(':') {
            Some((_, hex)) if hex.chars().count() >= SHORT_DIGEST_LEN => {
                hex.chars().take(SHORT_DIGEST_LEN).collect()
            }
            _ => digest.to_string(),
        };
    }

    let name_start = image.rfind('/').map(|slash| slash + 1).unwrap_or(0);
    match image[name_start..].rfind(':') {
        Some(colon) if name_start + colon + 1 < image.len() => {
            image[name_start + colon + 1..].to_string()
        }
        _ => DEFAULT_TAG.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_after_registry_port() {
        assert_eq!(extract_image_tag("registry:5000/app:v2"), "v2");
        assert_eq!(extract_image_tag("registry:5000/team/app"), "latest");
    }

    #[test]
    fn digest_is_shortened() {
        assert_eq!(extract_image_tag("app@sha256:abcdef0123456789"), "abcdef0");
        assert_eq!(
            extract_image_tag("ghcr.io/org/app:v1@sha256:0123456789abcdef"),
            "0123456"
        );
        assert_eq!(extract_image_tag("app@sha256:abc"), "sha256:abc");
    }

    #[test]
    fn bare_name_defaults_to_latest() {
        assert_eq!(extract_image_tag("app"), "latest");
        assert_eq!(extract_image_tag("app:"), "latest");
        assert_eq!(extract_image_tag("svc:1.0"), "1.0");
    }
}
