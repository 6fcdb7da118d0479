//! Mirrors a parsed book into the registry store.

use std::collections::BTreeSet;
use std::sync::Arc;

use armory_core::{ParsedBook, RecordId, SyncStage};
use armory_storage::ArmigerStore;
use serde::Serialize;
use tracing::debug;

use crate::identity::{IdentityResolver, Resolution};
use crate::SyncError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    pub deleted: usize,
    pub inserted: usize,
    pub updated: usize,
    pub linked: usize,
    pub unresolved: usize,
}

pub struct Reconciler {
    store: Arc<dyn ArmigerStore>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn ArmigerStore>) -> Self {
        Self { store }
    }

    /// Delete every stored id absent from `parsed`, then upsert each entry in id order,
    /// resolving identities right after each upsert when a resolver is given.
    ///
    /// Each store call commits on its own. A failure part-way leaves earlier
    /// steps applied; re-running with the same book converges.
    pub async fn reconcile(
        &self,
        parsed: &ParsedBook,
        resolver: Option<&IdentityResolver>,
    ) -> Result<ReconcileSummary, SyncError> {
        let persistence = |source| SyncError::Persistence {
            stage: SyncStage::Reconciling,
            source,
        };
        let mut summary = ReconcileSummary::default();

        let existing: BTreeSet<RecordId> =
            self.store.record_ids().await.map_err(persistence)?.into_iter().collect();

        for &stale in existing.iter().filter(|id| !parsed.contains_key(*id)) {
            if self.store.delete(stale).await.map_err(persistence)? {
                debug!(record_id = %stale, "deleted record absent from book");
                summary.deleted += 1;
            }
        }

        for (record_id, entry) in parsed {
            self.store.upsert(entry).await.map_err(persistence)?;
            if existing.contains(record_id) {
                summary.updated += 1;
            } else {
                summary.inserted += 1;
            }

            let Some(resolver) = resolver else {
                continue;
            };
            match resolver.resolve(*record_id).await? {
                Resolution::Linked(_) => summary.linked += 1,
                Resolution::Miss => summary.unresolved += 1,
                Resolution::AlreadyLinked | Resolution::NoRecord => {}
            }
        }

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use armory_core::{ArmigerEntry, IdentityId};
    use armory_storage::SqliteStore;

    use crate::identity::{Identity, RosterDirectory};

    fn entry(id: i64, name: &str) -> ArmigerEntry {
        ArmigerEntry {
            record_id: RecordId(id),
            qualified_name: name.to_string(),
            qualified_discriminator: format!("{id:04}"),
            blazon: format!("Blazon: device {id}"),
        }
    }

    fn book(entries: &[(i64, &str)]) -> ParsedBook {
        entries
            .iter()
            .map(|&(id, name)| (RecordId(id), entry(id, name)))
            .collect()
    }

    async fn store() -> Arc<SqliteStore> {
        Arc::new(SqliteStore::in_memory().await.unwrap())
    }

    #[tokio::test]
    async fn store_mirrors_each_parse() {
        let store = store().await;
        let reconciler = Reconciler::new(store.clone());

        let first = reconciler
            .reconcile(&book(&[(1, "A"), (2, "B"), (3, "C")]), None)
            .await
            .unwrap();
        assert_eq!(first.inserted, 3);

        let second = reconciler
            .reconcile(&book(&[(2, "B"), (3, "C2"), (4, "D")]), None)
            .await
            .unwrap();
        assert_eq!(
            second,
            ReconcileSummary {
                deleted: 1,
                inserted: 1,
                updated: 2,
                linked: 0,
                unresolved: 0,
            }
        );
        assert_eq!(
            store.record_ids().await.unwrap(),
            vec![RecordId(2), RecordId(3), RecordId(4)]
        );
        assert_eq!(store.get(RecordId(3)).await.unwrap().unwrap().qualified_name, "C2");
    }

    #[tokio::test]
    async fn empty_book_deletes_everything() {
        let store = store().await;
        let reconciler = Reconciler::new(store.clone());
        reconciler
            .reconcile(&book(&[(1, "A"), (2, "B")]), None)
            .await
            .unwrap();

        let summary = reconciler.reconcile(&ParsedBook::new(), None).await.unwrap();
        assert_eq!(summary.deleted, 2);
        assert!(store.record_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn resolution_links_once_and_never_relinks() {
        let store = store().await;
        let reconciler = Reconciler::new(store.clone());
        let directory = Arc::new(RosterDirectory::new(vec![Identity {
            id: IdentityId(42),
            name: "A".to_string(),
            discriminator: "0001".to_string(),
        }]));
        let resolver = IdentityResolver::new(store.clone(), directory);

        let summary = reconciler
            .reconcile(&book(&[(1, "A"), (2, "B")]), Some(&resolver))
            .await
            .unwrap();
        assert_eq!(summary.linked, 1);
        assert_eq!(summary.unresolved, 1);

        // Renamed in the book: the existing link stays.
        let renamed = reconciler
            .reconcile(&book(&[(1, "A the Bold"), (2, "B")]), Some(&resolver))
            .await
            .unwrap();
        assert_eq!(renamed.linked, 0);
        let record = store.get(RecordId(1)).await.unwrap().unwrap();
        assert_eq!(record.qualified_name, "A the Bold");
        assert_eq!(record.linked_identity_id, Some(IdentityId(42)));
    }
}
