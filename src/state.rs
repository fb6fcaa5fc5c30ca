use std::sync::Arc;

use anyhow::Context;

use crate::config::Settings;
use crate::history::ConversationStore;
use crate::llm::{Embedder, ProviderEmbedder, ProviderRouter};
use crate::rag::ingest::IngestConfig;
use crate::rag::{shared_index, BuildProgress, QueryRewriter, Retriever, SharedIndex};

#[derive(Clone)]
pub struct AppState {
    pub settings: Settings,
    pub providers: Arc<ProviderRouter>,
    pub retriever: Arc<Retriever>,
    pub index: SharedIndex,
    pub embedder: Arc<dyn Embedder>,
    pub history: ConversationStore,
    pub progress: BuildProgress,
}

impl AppState {
    pub async fn initialize(settings: Settings) -> anyhow::Result<Arc<Self>> {
        std::fs::create_dir_all(&settings.documents_path)
            .with_context(|| format!("creating {}", settings.documents_path.display()))?;
        std::fs::create_dir_all(&settings.vector_db_path)
            .with_context(|| format!("creating {}", settings.vector_db_path.display()))?;

        let providers = Arc::new(ProviderRouter::from_settings(&settings));
        let embedder: Arc<dyn Embedder> = Arc::new(ProviderEmbedder::new(
            providers.get(None).context("resolving default provider")?,
            settings.embedding_model.clone(),
        ));

        let initial = crate::rag::ingest::load_current_index(&settings.vector_db_path).await;
        if initial.is_some() {
            tracing::info!("vector index loaded from {}", settings.vector_db_path.display());
        } else {
            tracing::info!("no vector index found, knowledge base queries will report 409");
        }
        let index = shared_index(initial);

        let retriever = Arc::new(Retriever::new(
            index.clone(),
            embedder.clone(),
            QueryRewriter::with_default_rules(),
            settings.hybrid_alpha,
        ));

        let history = ConversationStore::open(settings.conversations_path.clone())
            .await
            .context("opening conversation store")?;

        Ok(Arc::new(AppState {
            settings,
            providers,
            retriever,
            index,
            embedder,
            history,
            progress: BuildProgress::default(),
        }))
    }

    pub fn ingest_config(&self) -> IngestConfig {
        IngestConfig {
            documents_path: self.settings.documents_path.clone(),
            vector_db_path: self.settings.vector_db_path.clone(),
            chunk_size: self.settings.chunk_size,
            chunk_overlap: self.settings.chunk_overlap,
        }
    }
}
