use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::cache::{DishCache, InflightPolicy};
use crate::config::ResolvedConfig;
use crate::document::{Document, MutationBatch, NodeId, SharedDocument, WatchId};
use crate::domain::ItemId;
use crate::error::MbtError;
use crate::gate::{RetryPolicy, wait_until};
use crate::locator::{AttributeSelector, CardLocator};
use crate::merge::merge_groups;
use crate::query::{
    DishResolver, DocumentCsrf, HttpTransport, ProbeReport, QueryTransport, RemoteQueryClient,
    Resolution,
};
use crate::render::{CardAnnotationState, CardRenderer};

/// Card → id → cached resolution → merged groups → painted slot.
pub struct AnnotationPipeline<R: DishResolver> {
    document: SharedDocument,
    resolver: Arc<R>,
    locator: Arc<dyn CardLocator>,
    cache: DishCache,
    renderer: CardRenderer,
    skipped: Mutex<HashSet<NodeId>>,
}

impl<R: DishResolver + 'static> AnnotationPipeline<R> {
    pub fn new(
        document: SharedDocument,
        resolver: Arc<R>,
        locator: Arc<dyn CardLocator>,
        anchor_class: &str,
        policy: InflightPolicy,
    ) -> Self {
        Self {
            renderer: CardRenderer::new(document.clone(), anchor_class),
            document,
            resolver,
            locator,
            cache: DishCache::new(policy),
            skipped: Mutex::new(HashSet::new()),
        }
    }

    pub fn document(&self) -> &SharedDocument {
        &self.document
    }

    pub fn resolver(&self) -> &R {
        &self.resolver
    }

    pub fn cache(&self) -> &DishCache {
        &self.cache
    }

    pub fn renderer(&self) -> &CardRenderer {
        &self.renderer
    }

    /// Runs one card through the pipeline. Never fails: faults end up as the
    /// card's Error state, cards without an item id stay untouched.
    pub async fn annotate(&self, card: NodeId) -> CardAnnotationState {
        let identity = self
            .document
            .read(|document| document.attribute(card, "id").map(str::to_string));
        let Some(item_id) = identity.as_deref().and_then(ItemId::from_card_identity) else {
            self.log_skip(card, identity.as_deref());
            return CardAnnotationState::Idle;
        };
        tracing::debug!(%card, %item_id, "annotating card");

        if let Err(err) = self.renderer.begin(card) {
            tracing::error!(%card, %item_id, error = %err, "failed to prepare annotation slot");
            return self.renderer.fail(card);
        }

        let resolver = self.resolver.clone();
        let resolution = self
            .cache
            .get_or_fetch(item_id, move || async move { resolver.resolve(item_id).await })
            .await;
        if resolution == Resolution::Unavailable {
            return self.renderer.fail(card);
        }

        let groups = merge_groups(resolution.record());
        tracing::debug!(%card, %item_id, groups = groups.len(), "merged modifier groups");
        match self.renderer.finish(card, &groups) {
            Ok(state) => state,
            Err(err) => {
                tracing::error!(%card, %item_id, error = %err, "failed to render modifier tags");
                self.renderer.fail(card)
            }
        }
    }

    /// Every card currently present in the document.
    pub fn cards(&self) -> Vec<NodeId> {
        self.document.read(|document| {
            self.locator
                .find_descendant_markers(document, document.root())
        })
    }

    /// Cards introduced by one batch: each added node that is itself a card,
    /// plus the cards nested inside it.
    pub fn cards_in_batch(&self, document: &Document, batch: &MutationBatch) -> Vec<NodeId> {
        let mut cards = Vec::new();
        for &node in &batch.added {
            if self.locator.matches_marker(document, node) {
                cards.push(node);
            }
            cards.extend(self.locator.find_descendant_markers(document, node));
        }
        cards
    }

    fn log_skip(&self, card: NodeId, identity: Option<&str>) {
        let first = self
            .skipped
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(card);
        if first {
            tracing::warn!(
                %card,
                identity = identity.unwrap_or("<missing>"),
                "could not extract menu item id; skipping card"
            );
        }
    }
}

/// Handles of the per-card tasks spawned by a sweep.
#[derive(Debug)]
pub struct SweepHandle {
    tasks: Vec<(NodeId, JoinHandle<CardAnnotationState>)>,
}

impl SweepHandle {
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub async fn finished(self) -> Vec<(NodeId, CardAnnotationState)> {
        let mut out = Vec::with_capacity(self.tasks.len());
        for (card, task) in self.tasks {
            let state = match task.await {
                Ok(state) => state,
                Err(err) => {
                    tracing::error!(%card, error = %err, "annotation task aborted");
                    CardAnnotationState::Error
                }
            };
            out.push((card, state));
        }
        out
    }
}

#[derive(Debug)]
pub enum Activation {
    Started(SweepHandle),
    /// The startup gate ran out of attempts before any card appeared.
    NotStarted,
}

enum Lifecycle {
    Idle,
    Starting,
    Active { watch: WatchId, task: JoinHandle<()> },
}

/// The modifier-tags feature for one page session: owns the pipeline and
/// the document watch, and is the handle an operator uses to detach it.
pub struct Toolkit<R: DishResolver + 'static> {
    pipeline: Arc<AnnotationPipeline<R>>,
    container: Option<AttributeSelector>,
    startup: RetryPolicy,
    lifecycle: Mutex<Lifecycle>,
}

impl<R: DishResolver + 'static> Toolkit<R> {
    pub fn new(
        pipeline: AnnotationPipeline<R>,
        container: Option<AttributeSelector>,
        startup: RetryPolicy,
    ) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            container,
            startup,
            lifecycle: Mutex::new(Lifecycle::Idle),
        }
    }

    pub fn pipeline(&self) -> &Arc<AnnotationPipeline<R>> {
        &self.pipeline
    }

    pub fn is_active(&self) -> bool {
        matches!(*self.lock(), Lifecycle::Active { .. })
    }

    pub async fn start(&self) -> Result<Activation, MbtError> {
        self.start_with(tokio::time::sleep).await
    }

    /// `start` with an injected sleep for the startup gate.
    pub async fn start_with<S, Fut>(&self, sleep: S) -> Result<Activation, MbtError>
    where
        S: FnMut(Duration) -> Fut,
        Fut: Future<Output = ()>,
    {
        {
            let mut lifecycle = self.lock();
            if !matches!(*lifecycle, Lifecycle::Idle) {
                return Err(MbtError::AlreadyStarted);
            }
            *lifecycle = Lifecycle::Starting;
        }

        let attempts = wait_until(self.startup, || !self.pipeline.cards().is_empty(), sleep).await;
        let Some(attempts) = attempts else {
            tracing::warn!(
                attempts = self.startup.max_attempts,
                "no menu cards detected; modifier tags not started"
            );
            *self.lock() = Lifecycle::Idle;
            return Ok(Activation::NotStarted);
        };

        let attached = self.pipeline.document().write(|document| {
            let root = document.root();
            let scope = self
                .container
                .as_ref()
                .and_then(|selector| selector.first_match(document, root))
                .unwrap_or(root);
            let cards = self
                .pipeline
                .locator
                .find_descendant_markers(document, root);
            document.observe(scope).map(|watch| (cards, watch))
        });
        let (cards, watch) = match attached {
            Ok(attached) => attached,
            Err(err) => {
                *self.lock() = Lifecycle::Idle;
                return Err(err);
            }
        };

        tracing::info!(cards = cards.len(), attempts, "found menu cards, starting modifier tags");
        let sweep = self.spawn_all(cards);
        let task = tokio::spawn(observe(self.pipeline.clone(), watch.receiver));
        *self.lock() = Lifecycle::Active {
            watch: watch.id,
            task,
        };
        tracing::info!("modifier tags initialized, observer attached");
        Ok(Activation::Started(sweep))
    }

    /// Re-annotates every card currently in the document.
    pub fn sweep(&self) -> SweepHandle {
        let cards = self.pipeline.cards();
        tracing::info!(cards = cards.len(), "sweeping menu cards");
        self.spawn_all(cards)
    }

    /// Detaches the document watch. Returns false when nothing was attached.
    pub fn stop(&self) -> bool {
        let mut lifecycle = self.lock();
        if !matches!(*lifecycle, Lifecycle::Active { .. }) {
            return false;
        }
        if let Lifecycle::Active { watch, task } = std::mem::replace(&mut *lifecycle, Lifecycle::Idle) {
            self.pipeline.document().write(|document| document.disconnect(watch));
            task.abort();
        }
        tracing::info!("modifier tags observer detached");
        true
    }

    fn spawn_all(&self, cards: Vec<NodeId>) -> SweepHandle {
        let tasks = cards
            .into_iter()
            .map(|card| {
                let pipeline = self.pipeline.clone();
                (card, tokio::spawn(async move { pipeline.annotate(card).await }))
            })
            .collect();
        SweepHandle { tasks }
    }

    fn lock(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<T: QueryTransport + 'static> Toolkit<RemoteQueryClient<T>> {
    /// Runs both query tiers for `item_id`, bypassing the cache.
    pub async fn probe(&self, item_id: ItemId) -> ProbeReport {
        self.pipeline.resolver().probe(item_id).await
    }
}

impl Toolkit<RemoteQueryClient<HttpTransport>> {
    pub fn from_config(config: &ResolvedConfig, document: SharedDocument) -> Result<Self, MbtError> {
        let transport = HttpTransport::new(&config.endpoint, config.timeout)?;
        let csrf = DocumentCsrf::new(document.clone(), config.csrf_token.clone());
        let client = RemoteQueryClient::new(
            transport,
            Arc::new(csrf),
            &config.operation_name,
            config.operation_id.as_deref(),
        );
        let pipeline = AnnotationPipeline::new(
            document,
            Arc::new(client),
            Arc::new(config.card_selector.clone()),
            &config.anchor_class,
            config.inflight,
        );
        Ok(Self::new(
            pipeline,
            config.container_selector.clone(),
            config.startup,
        ))
    }
}

async fn observe<R: DishResolver + 'static>(
    pipeline: Arc<AnnotationPipeline<R>>,
    mut receiver: tokio::sync::mpsc::UnboundedReceiver<MutationBatch>,
) {
    while let Some(batch) = receiver.recv().await {
        let cards = pipeline
            .document()
            .read(|document| pipeline.cards_in_batch(document, &batch));
        if !cards.is_empty() {
            tracing::debug!(cards = cards.len(), "new card nodes detected");
        }
        for card in cards {
            let pipeline = pipeline.clone();
            tokio::spawn(async move { pipeline.annotate(card).await });
        }
    }
    tracing::debug!("document watch closed");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::domain::{DishRecord, GroupEntry};

    struct FixedResolver {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl DishResolver for FixedResolver {
        async fn resolve(&self, item_id: ItemId) -> Resolution {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Resolution::Found(
                DishRecord {
                    item_id,
                    name: None,
                    groups_primary: vec![GroupEntry::named(1, "Size")],
                    groups_secondary: Vec::new(),
                },
                crate::query::QueryTier::Compact,
            )
        }
    }

    fn pipeline(document: &SharedDocument) -> AnnotationPipeline<FixedResolver> {
        AnnotationPipeline::new(
            document.clone(),
            Arc::new(FixedResolver {
                calls: AtomicUsize::new(0),
            }),
            Arc::new(AttributeSelector::menu_item_card()),
            "MuiCardHeader-content",
            InflightPolicy::Collapse,
        )
    }

    fn add_card(document: &SharedDocument, identity: Option<&str>) -> NodeId {
        document.write(|doc| {
            let root = doc.root();
            let card = doc.create_element("div");
            doc.set_attribute(card, "data-cy", "menu_item_card").unwrap();
            if let Some(identity) = identity {
                doc.set_attribute(card, "id", identity).unwrap();
            }
            doc.append_child(root, card).unwrap();
            card
        })
    }

    #[tokio::test]
    async fn card_without_item_id_is_skipped() {
        let document = SharedDocument::default();
        let card = add_card(&document, Some("item-482"));
        let pipeline = pipeline(&document);
        assert_eq!(pipeline.annotate(card).await, CardAnnotationState::Idle);
        assert_eq!(pipeline.resolver().calls.load(Ordering::SeqCst), 0);
        assert!(document.read(|doc| doc.children(card).is_empty()));
    }

    #[tokio::test]
    async fn batch_includes_self_and_nested_cards() {
        let document = SharedDocument::default();
        let pipeline = pipeline(&document);
        let (wrapper, card) = document.write(|doc| {
            let wrapper = doc.create_element("section");
            let card = doc.create_element("div");
            doc.set_attribute(card, "data-cy", "menu_item_card").unwrap();
            doc.append_child(wrapper, card).unwrap();
            (wrapper, card)
        });
        let direct = add_card(&document, Some("1-item"));
        let batch = MutationBatch {
            added: vec![wrapper, direct],
        };
        let cards = document.read(|doc| pipeline.cards_in_batch(doc, &batch));
        assert_eq!(cards, vec![card, direct]);
    }
}
