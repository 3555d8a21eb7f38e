// Copyright 2026 Developers of the converge project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Text sub-diffs in the diff-match-patch patch format.
//!
//! String edits travel on the wire as DMP patch text, so this module is the
//! single place that talks to the DMP implementation. The rest of the algebra
//! only sees opaque patch strings.

use diff_match_patch_rs::{DiffMatchPatch, Efficient, PatchInput};

use crate::error::DiffError;

/// Compute a patch string transforming `base` into `modified`.
pub fn make_patch(base: &str, modified: &str) -> Result<String, DiffError> {
    let dmp = DiffMatchPatch::new();
    let diffs = dmp
        .diff_main::<Efficient>(base, modified)
        .map_err(text_error)?;
    let patches = dmp
        .patch_make(PatchInput::new_diffs(&diffs))
        .map_err(text_error)?;
    Ok(dmp.patch_to_text(&patches))
}

/// Apply a patch string to `base`. Fails unless every hunk applies.
pub fn apply_patch(patch: &str, base: &str) -> Result<String, DiffError> {
    let dmp = DiffMatchPatch::new();
    let patches = dmp.patch_from_text::<Efficient>(patch).map_err(text_error)?;
    let (applied, results) = dmp.patch_apply(&patches, base).map_err(text_error)?;
    if results.iter().any(|ok| !ok) {
        return Err(DiffError::TextPatch(
            "patch did not apply cleanly".to_string(),
        ));
    }
    Ok(applied)
}

/// Rebase the `local` patch onto the result of applying `upstream` to `base`.
///
/// Returns `None` when DMP cannot place the local hunks on the upstream
/// result, or when the rebased edit turns out to change nothing; in both
/// cases the upstream side wins and the caller drops the local operation.
pub fn transform_patch(
    local: &str,
    upstream: &str,
    base: &str,
) -> Result<Option<String>, DiffError> {
    let upstreamed = apply_patch(upstream, base)?;
    let dmp = DiffMatchPatch::new();
    let patches = match dmp.patch_from_text::<Efficient>(local) {
        Ok(patches) => patches,
        Err(_) => return Ok(None),
    };
    let (rebased, results) = match dmp.patch_apply(&patches, &upstreamed) {
        Ok(outcome) => outcome,
        Err(_) => return Ok(None),
    };
    if results.iter().any(|ok| !ok) || rebased == upstreamed {
        return Ok(None);
    }
    Ok(Some(make_patch(&upstreamed, &rebased)?))
}

fn text_error(err: diff_match_patch_rs::Error) -> DiffError {
    DiffError::TextPatch(format!("{err:?}"))
}
