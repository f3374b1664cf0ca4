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

/// Upper bound applied to response bodies echoed into errors and logs.
pub const MAX_ECHOED_BODY_BYTES: usize = 512;

/// Strips newline, carriage-return, and tab characters so user-derived values
/// cannot forge extra log lines or annotation fields.
pub fn sanitize_for_log(input: &str) -> String {
    input
        .chars()
        .filter(|c| !matches!(c, '\n' | '\r' | '\t'))
        .collect()
}

/// Sanitizes `body` and truncates it to [`MAX_ECHOED_BODY_BYTES`] on a char
/// boundary.
pub fn bounded_body(body: &str) -> String {
    let mut sanitized = sanitize_for_log(body);
    if sanitized.len() > MAX_ECHOED_BODY_BYTES {
        let mut cut = MAX_ECHOED_BODY_BYTES;
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized.truncate(cut);
    }
    sanitized
}
