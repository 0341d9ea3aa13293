//! One retraining cycle
//!
//! sampler (positives) -> term selector -> sampler (negatives) -> encoder
//! -> trainer. Both corpora are encoded against the *next* query, which is
//! the query the new classifier will be paired with in its snapshot.

use super::classifier::{ClassifierTrainer, Label, LogisticTrainer};
use super::encoder::FeatureEncoder;
use super::sampler::CorpusSampler;
use super::terms::{Selection, TermIndex, TermSelector};
use super::RetrainError;
use crate::config::AppConfig;
use crate::storage::DocumentStore;
use crate::stream::StreamClient;
use crate::text::Tokenizer;
use crate::types::{Generation, ModelSnapshot, QuerySet};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info};

/// Result of a successful cycle
#[derive(Debug, Clone)]
pub struct RetrainOutcome {
    pub snapshot: Arc<ModelSnapshot>,
    pub selection: Selection,
}

/// Runs retraining cycles; shared by the scheduler and the CLI
pub struct RetrainPipeline {
    sampler: CorpusSampler,
    selector: TermSelector,
    encoder: FeatureEncoder,
    trainer: Arc<dyn ClassifierTrainer>,
    seed: Arc<QuerySet>,
}

impl RetrainPipeline {
    pub fn new(
        sampler: CorpusSampler,
        selector: TermSelector,
        encoder: FeatureEncoder,
        trainer: Arc<dyn ClassifierTrainer>,
        seed: QuerySet,
    ) -> Self {
        Self {
            sampler,
            selector,
            encoder,
            trainer,
            seed: Arc::new(seed),
        }
    }

    /// Pipeline wired from configuration with the built-in logistic trainer
    pub fn from_config(
        config: &AppConfig,
        store: Arc<dyn DocumentStore>,
        stream: Arc<dyn StreamClient>,
    ) -> Self {
        let tokenizer = Arc::new(Tokenizer::new(&config.filter.languages));
        let sampler = CorpusSampler::new(
            store,
            stream,
            tokenizer.clone(),
            config.filter.remodel_interval(),
            config.filter.sample_timeout(),
        )
        .with_retry_delay(config.stream.reconnect_delay());
        let selector = TermSelector::new(
            config.filter.top_k,
            config.filter.min_author_documents,
            config.filter.expansion,
        );

        Self::new(
            sampler,
            selector,
            FeatureEncoder::new(tokenizer),
            Arc::new(LogisticTrainer::default()),
            config.seed.query_set(),
        )
    }

    pub fn seed(&self) -> &QuerySet {
        &self.seed
    }

    /// Train generation `generation` starting from the `current` query
    pub async fn run(
        &self,
        current: &QuerySet,
        generation: Generation,
    ) -> Result<RetrainOutcome, RetrainError> {
        let positives = self.sampler.positives(Utc::now()).await?;

        let index = TermIndex::build(self.encoder.tokenizer(), &positives);
        let selection = self.selector.select(&index, current);
        let next = Arc::new(self.selector.next_query(&self.seed, current, &selection));
        info!(
            "{}: +{} keywords, +{} authors -> {}",
            generation,
            selection.keywords.len(),
            selection.authors.len(),
            next
        );

        let negatives = self.sampler.negatives(positives.len(), next.clone()).await?;

        let mut vectors = self.encoder.encode_all(&positives, &next);
        vectors.extend(self.encoder.encode_all(&negatives, &next));
        let labels: Vec<Label> = std::iter::repeat(Label::Positive)
            .take(positives.len())
            .chain(std::iter::repeat(Label::Negative).take(negatives.len()))
            .collect();
        debug!("Training on {} vectors", vectors.len());

        let trainer = self.trainer.clone();
        let classifier = tokio::task::spawn_blocking(move || trainer.fit(&vectors, &labels))
            .await
            .map_err(|e| RetrainError::Training(format!("training task failed: {}", e)))??;

        let snapshot = Arc::new(ModelSnapshot {
            generation,
            classifier,
            query: next,
            trained_at: Utc::now(),
            positives: positives.len(),
            negatives: negatives.len(),
        });

        Ok(RetrainOutcome {
            snapshot,
            selection,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::terms::ExpansionPolicy;
    use crate::storage::MemoryDocumentStore;
    use crate::stream::memory::MemoryStreamClient;
    use crate::text::Language;
    use crate::types::Document;
    use std::time::Duration;

    fn pipeline(
        store: Arc<MemoryDocumentStore>,
        stream: Arc<MemoryStreamClient>,
        seed: QuerySet,
    ) -> RetrainPipeline {
        let tokenizer = Arc::new(Tokenizer::new(&[Language::English]));
        let sampler = CorpusSampler::new(
            store,
            stream,
            tokenizer.clone(),
            Duration::from_secs(3600),
            Duration::from_secs(5),
        );
        RetrainPipeline::new(
            sampler,
            TermSelector::new(2, 10, ExpansionPolicy::Expand),
            FeatureEncoder::new(tokenizer),
            Arc::new(LogisticTrainer::default()),
            seed,
        )
    }

    #[tokio::test]
    async fn test_cycle_expands_query_and_trains() {
        let store = Arc::new(MemoryDocumentStore::new());
        let stream = Arc::new(MemoryStreamClient::default());
        let now = Utc::now();

        for (i, text) in ["obama senate vote", "senate vote usa", "obama vote today"]
            .iter()
            .enumerate()
        {
            store
                .insert_document(&Document::new(&format!("p{}", i), "1", text, now))
                .await
                .unwrap();
        }
        stream.queue_sample(vec![
            Document::new("n1", "2", "sunny weather", now),
            Document::new("n2", "2", "senate lunch", now),
            Document::new("n3", "2", "cat pictures", now),
            Document::new("n4", "2", "new recipes", now),
        ]);

        let seed = QuerySet::new(["obama", "usa"], Vec::<&str>::new());
        let outcome = pipeline(store, stream, seed.clone())
            .run(&seed, Generation(1))
            .await
            .unwrap();

        assert_eq!(outcome.selection.keywords, vec!["vote", "senate"]);
        let query = &outcome.snapshot.query;
        assert!(query.is_superset_of(&seed));
        assert_eq!(query.keyword_count(), 4);
        assert_eq!(outcome.snapshot.positives, 3);
        assert_eq!(outcome.snapshot.negatives, 3);
        assert_eq!(outcome.snapshot.generation, Generation(1));
    }

    #[tokio::test]
    async fn test_empty_store_fails_cycle() {
        let seed = QuerySet::new(["obama"], Vec::<&str>::new());
        let result = pipeline(
            Arc::new(MemoryDocumentStore::new()),
            Arc::new(MemoryStreamClient::default()),
            seed.clone(),
        )
        .run(&seed, Generation(1))
        .await;
        assert!(matches!(result, Err(RetrainError::EmptyCorpus { .. })));
    }
}
