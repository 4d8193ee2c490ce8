use std::path::PathBuf;
use std::sync::Arc;

use metadata::{split_tracks, AppliedCue, CueSheet, MetadataError, TagInfo};
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use super::folder::FolderReconciliation;
use super::mapper::to_track;
use super::{CueSource, ScanPass, TagScanner};
use crate::{now_ms, LibraryError};

impl TagScanner {
    /// Extracts `files` in batches and writes the resulting tracks.
    ///
    /// Stops at the first extraction or write error; tracks written before it
    /// stay in the catalog and are counted.
    pub(super) async fn load_tracks(
        &self,
        pass: &mut ScanPass,
        folder: &mut FolderReconciliation,
        files: Vec<PathBuf>,
        cancel: &CancellationToken,
    ) -> Result<(), LibraryError> {
        for batch in files.chunks(self.options.batch_size.max(1)) {
            if cancel.is_cancelled() {
                return Err(LibraryError::Cancelled);
            }

            let paths = batch.to_vec();
            let extractor = Arc::clone(&self.extractor);
            let tags = tokio::task::spawn_blocking(move || extractor.extract(&paths))
                .await
                .map_err(|err| {
                    MetadataError::Extractor(format!("extractor task failed: {}", err))
                })??;

            let now = now_ms();
            for tag in tags {
                for info in self.resolve_cues(pass, tag) {
                    let mut track = to_track(&info, now);
                    let existed = folder.claim(&mut track);
                    self.catalog.put_track(&track)?;
                    pass.refresher.accumulate(&track);
                    if existed {
                        pass.counters.updated += 1;
                    } else {
                        pass.counters.added += 1;
                    }
                    trace!("Stored {:?} #{}", track.path, track.sub_track);
                }
            }
        }
        Ok(())
    }

    /// Splits a file into sub-tracks when a cue sheet describes it; otherwise
    /// returns the file unchanged.
    fn resolve_cues(&self, pass: &ScanPass, tag: TagInfo) -> Vec<TagInfo> {
        let support = &self.options.cue_support;
        let embedded = match tag.cue_sheet.as_deref() {
            Some(text) if support.includes_embedded() => match CueSheet::parse(text) {
                Ok(sheet) => Some(sheet),
                Err(err) => {
                    warn!("Ignoring embedded cue sheet in {:?}: {}", tag.path, err);
                    None
                }
            },
            _ => None,
        };
        let external = if support.includes_external() {
            pass.cues_for(&tag.path)
        } else {
            Vec::new()
        };

        let mut applied = Vec::new();
        for source in support.modes() {
            match source {
                CueSource::Embedded => {
                    if let Some(sheet) = &embedded {
                        applied.push(AppliedCue {
                            sheet,
                            embedded: true,
                        });
                    }
                }
                CueSource::External => {
                    for sheet in &external {
                        applied.push(AppliedCue {
                            sheet: sheet.as_ref(),
                            embedded: false,
                        });
                    }
                }
            }
        }
        if applied.is_empty() {
            return vec![tag];
        }

        let tracks = split_tracks(&tag, &applied);
        if tracks.is_empty() {
            vec![tag]
        } else {
            tracks
        }
    }
}
