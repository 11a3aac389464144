//! File and slice close operations, run as exclusive tasks

use crate::error::{Error, Result};
use crate::files::{FileManager, Rollback};
use crate::model::{FileKey, SliceKey};
use crate::store::Store;
use tracing::debug;

/// Close the opened file of the export and open a new file and slice.
///
/// The export is read again from the store; the file must still be the opened
/// one. A new upload target is allocated and released again if the swap fails.
pub(super) async fn close_file(
    store: &Store,
    files: &dyn FileManager,
    file_key: &FileKey,
) -> Result<String> {
    let context = format!("cannot close file \"{}\"", file_key);
    let mut export = store
        .get_export(file_key.export_key())
        .await
        .map_err(|err| err.context(context.clone()))?;

    if &export.opened_file.key != file_key {
        return Err(Error::Mismatch(format!(
            "{}: unexpected export opened file \"{}\"",
            context, export.opened_file.key
        )));
    }
    let old_file = export.opened_file.clone();
    let old_slice = export.opened_slice.clone();

    let mut rb = Rollback::new();
    let result = async {
        files
            .create_file_for_export(&mut rb, &mut export)
            .await
            .map_err(|err| err.context("cannot create new file"))?;
        store
            .swap_file(&old_file, &old_slice, &export.opened_file, &export.opened_slice)
            .await
            .map_err(|err| err.context("cannot swap old and new file"))
    }
    .await;
    rb.invoke_if_err(&result).await;

    result.map_err(|err| err.context(context))?;
    debug!(file = %file_key, new_file = %export.opened_file.key, "file swapped");
    Ok("file switched to the closing state".to_string())
}

/// Close the opened slice of the file and open the next one.
pub(super) async fn close_slice(store: &Store, slice_key: &SliceKey) -> Result<String> {
    let context = format!("cannot close slice \"{}\"", slice_key);
    let export = store
        .get_export(slice_key.export_key())
        .await
        .map_err(|err| err.context(context.clone()))?;

    if &export.opened_slice.key != slice_key {
        return Err(Error::Mismatch(format!(
            "{}: unexpected export opened slice \"{}\"",
            context, export.opened_slice.key
        )));
    }

    let (_, new) = store
        .swap_slice(&export.opened_slice)
        .await
        .map_err(|err| err.context(context))?;
    debug!(slice = %slice_key, new_slice = %new.key, "slice swapped");
    Ok("slice switched to the closing state".to_string())
}
