//! Source folder -> remote document store synchronization.
//!
//! One run is: reconcile the correspondence map against the live listing,
//! scan the source folder, upload what is missing, rename it to its
//! canonical name. A single document failing never aborts the run.
//! Runs are not safe to overlap; the caller serializes them.

use std::{collections::HashSet, sync::Arc, time::Duration};

use tracing::{debug, info, warn};

use crate::{
    config::SyncConfig,
    correspondence::{CorrespondenceMap, CorrespondenceStore},
    errors::Error,
    ports::{DocumentStore, RemoteDocument, SourceDocument, SourceFolder},
    Result,
};

const PDF: &str = "application/pdf";

/// Source types that pass through unchanged.
const NATIVE_TYPES: &[&str] = &[
    PDF,
    "text/plain",
    "text/markdown",
    "text/csv",
    "text/html",
    "application/json",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
    "application/vnd.openxmlformats-officedocument.presentationml.presentation",
];

/// Office-native types that must be exported before upload.
const EXPORTABLE_TYPES: &[&str] = &[
    "application/vnd.google-apps.document",
    "application/vnd.google-apps.spreadsheet",
    "application/vnd.google-apps.presentation",
];

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PayloadPlan {
    /// Download the raw bytes and upload with the source type.
    Download { mime_type: String },
    /// Export to `mime_type` first.
    Export { mime_type: String },
    Unsupported,
}

pub fn payload_plan(mime_type: &str) -> PayloadPlan {
    if NATIVE_TYPES.contains(&mime_type) {
        PayloadPlan::Download {
            mime_type: mime_type.to_string(),
        }
    } else if EXPORTABLE_TYPES.contains(&mime_type) {
        PayloadPlan::Export {
            mime_type: PDF.to_string(),
        }
    } else {
        PayloadPlan::Unsupported
    }
}

/// Name the document is expected to carry once ingested.
pub fn expected_remote_name(doc: &SourceDocument) -> String {
    let name = doc.raw_name.trim();
    match payload_plan(&doc.mime_type) {
        PayloadPlan::Export { .. } if !name.to_ascii_lowercase().ends_with(".pdf") => {
            format!("{name}.pdf")
        }
        _ => name.to_string(),
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub uploaded: usize,
    pub skipped: usize,
    pub unsupported: usize,
    pub failed: usize,
    /// Uploads whose rename never succeeded (still ingested).
    pub rename_failures: usize,
    pub orphans_removed: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClearReport {
    pub deleted: usize,
    pub failed: usize,
    /// Passes that still found live documents.
    pub passes: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InventoryEntry {
    pub id: String,
    pub display_name: String,
    pub canonical_name: Option<String>,
}

struct Reconciled {
    map: CorrespondenceMap,
    known_names: HashSet<String>,
    orphans_removed: usize,
}

enum Ingested {
    /// `checkpointed` is false when the map could not be saved; the rename
    /// still runs so the live display name keeps later runs from re-uploading.
    Uploaded { renamed: bool, checkpointed: bool },
    Unsupported,
}

pub struct DocumentSynchronizer {
    store: Arc<dyn DocumentStore>,
    source: Option<Arc<dyn SourceFolder>>,
    names: CorrespondenceStore,
    document_delay: Duration,
    rename_base_delay: Duration,
    rename_attempts: u32,
    clear_passes: u32,
}

impl DocumentSynchronizer {
    /// Store administration only; [`Self::sync`] also needs [`Self::with_source`].
    pub fn new(
        cfg: &SyncConfig,
        store: Arc<dyn DocumentStore>,
        names: CorrespondenceStore,
    ) -> Self {
        Self {
            store,
            source: None,
            names,
            document_delay: cfg.document_delay,
            rename_base_delay: cfg.rename_base_delay,
            rename_attempts: cfg.rename_attempts.max(1),
            clear_passes: cfg.clear_passes.max(1),
        }
    }

    pub fn with_source(mut self, source: Arc<dyn SourceFolder>) -> Self {
        self.source = Some(source);
        self
    }

    async fn live_documents(&self) -> Result<Vec<RemoteDocument>> {
        let mut out = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let page = self.store.list_documents(token.as_deref()).await?;
            out.extend(page.documents);
            match page.next_page_token {
                Some(t) if !t.is_empty() => token = Some(t),
                _ => break,
            }
        }
        Ok(out)
    }

    async fn reconcile(&self) -> Result<Reconciled> {
        let mut map = self.names.load().await?;
        let live = self.live_documents().await?;
        let live_ids: HashSet<&str> = live.iter().map(|d| d.id.as_str()).collect();

        let before = map.len();
        map.retain(|id, _| live_ids.contains(id.as_str()));
        let orphans_removed = before - map.len();
        if orphans_removed > 0 {
            info!(orphans_removed, "Dropping orphaned correspondence entries");
            self.names.save(&map).await?;
        }

        let known_names = map
            .values()
            .cloned()
            .chain(live.iter().map(|d| d.display_name.clone()))
            .collect();

        Ok(Reconciled {
            map,
            known_names,
            orphans_removed,
        })
    }

    pub async fn sync(&self) -> Result<SyncReport> {
        let Some(source) = &self.source else {
            return Err(Error::Config("no source folder configured".to_string()));
        };
        let Reconciled {
            mut map,
            mut known_names,
            orphans_removed,
        } = self.reconcile().await?;
        let mut report = SyncReport {
            orphans_removed,
            ..SyncReport::default()
        };

        let sources = source.list_documents().await?;
        info!(count = sources.len(), known = known_names.len(), "Sync scan");

        for doc in sources {
            let name = expected_remote_name(&doc);
            if known_names.contains(&name) {
                debug!(name = %name, "Already ingested");
                report.skipped += 1;
                continue;
            }

            match self.ingest(source.as_ref(), &doc, &name, &mut map).await {
                Ok(Ingested::Unsupported) => {
                    warn!(name = %name, mime_type = %doc.mime_type, "Unsupported source type, skipping");
                    report.unsupported += 1;
                    continue;
                }
                Ok(Ingested::Uploaded {
                    renamed,
                    checkpointed,
                }) => {
                    if checkpointed {
                        report.uploaded += 1;
                    } else {
                        report.failed += 1;
                    }
                    if !renamed {
                        report.rename_failures += 1;
                    }
                    known_names.insert(name);
                }
                Err(e) => {
                    warn!(name = %name, source_id = %doc.source_id, "Sync failed for document: {e}");
                    report.failed += 1;
                }
            }

            tokio::time::sleep(self.document_delay).await;
        }

        info!(
            uploaded = report.uploaded,
            skipped = report.skipped,
            unsupported = report.unsupported,
            failed = report.failed,
            "Sync finished"
        );
        Ok(report)
    }

    async fn ingest(
        &self,
        source: &dyn SourceFolder,
        doc: &SourceDocument,
        name: &str,
        map: &mut CorrespondenceMap,
    ) -> Result<Ingested> {
        let (bytes, mime_type) = match payload_plan(&doc.mime_type) {
            PayloadPlan::Unsupported => return Ok(Ingested::Unsupported),
            PayloadPlan::Download { mime_type } => {
                (source.download(&doc.source_id).await?, mime_type)
            }
            PayloadPlan::Export { mime_type } => (
                source.export(&doc.source_id, &mime_type).await?,
                mime_type,
            ),
        };

        let file = self.store.upload_blob(bytes, &mime_type, name).await?;
        let document_id = self.store.import_file(&file).await?;

        map.insert(document_id.clone(), name.to_string());
        let checkpointed = match self.names.save(map).await {
            Ok(()) => true,
            Err(e) => {
                warn!(name = %name, document_id = %document_id, "Saving correspondence map failed: {e}");
                false
            }
        };
        info!(name = %name, document_id = %document_id, "Uploaded");

        let renamed = self.rename_with_retry(&document_id, name).await;
        Ok(Ingested::Uploaded {
            renamed,
            checkpointed,
        })
    }

    async fn rename_with_retry(&self, document_id: &str, name: &str) -> bool {
        for attempt in 1..=self.rename_attempts {
            tokio::time::sleep(self.rename_base_delay * attempt).await;
            match self.store.rename_document(document_id, name).await {
                Ok(()) => return true,
                Err(e) => debug!(document_id, attempt, "Rename attempt failed: {e}"),
            }
        }
        warn!(
            document_id,
            name, "Rename failed, document keeps its assigned name"
        );
        false
    }

    /// Delete every live document, then forget all correspondences.
    pub async fn clear_all(&self) -> Result<ClearReport> {
        let mut report = ClearReport::default();

        for _ in 0..self.clear_passes {
            let mut found = 0usize;
            let mut token: Option<String> = None;
            loop {
                let page = self.store.list_documents(token.as_deref()).await?;
                found += page.documents.len();
                for doc in &page.documents {
                    match self.store.delete_document(&doc.id, true).await {
                        Ok(()) => report.deleted += 1,
                        Err(e) => {
                            warn!(document_id = %doc.id, "Delete failed: {e}");
                            report.failed += 1;
                        }
                    }
                }
                match page.next_page_token {
                    Some(t) if !t.is_empty() => token = Some(t),
                    _ => break,
                }
            }
            if found == 0 {
                break;
            }
            report.passes += 1;
        }

        self.names.save(&CorrespondenceMap::new()).await?;
        info!(deleted = report.deleted, failed = report.failed, "Store cleared");
        Ok(report)
    }

    /// Live listing joined with the canonical names the map knows.
    pub async fn inventory(&self) -> Result<Vec<InventoryEntry>> {
        let map = self.names.load().await?;
        Ok(self
            .live_documents()
            .await?
            .into_iter()
            .map(|d| InventoryEntry {
                canonical_name: map.get(&d.id).cloned(),
                id: d.id,
                display_name: d.display_name,
            })
            .collect())
    }

    pub async fn delete_document(&self, document_id: &str) -> Result<()> {
        self.store.delete_document(document_id, true).await?;
        let mut map = self.names.load().await?;
        if map.remove(document_id).is_some() {
            self.names.save(&map).await?;
        }
        Ok(())
    }
}
