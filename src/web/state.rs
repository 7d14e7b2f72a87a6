use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use crate::{
    config::{RatingPolicy, SurveyConfig},
    store::{self, RatingStore},
    survey::{PostSet, SessionRegistry, load_posts, posts::post_source_for},
};

/// Process-wide resources, built once at startup and shared by every request.
#[derive(Clone)]
pub struct AppState {
    posts: Arc<PostSet>,
    store: Arc<dyn RatingStore>,
    sessions: SessionRegistry,
    rating_policy: RatingPolicy,
}

impl AppState {
    pub fn new(config: &SurveyConfig) -> Result<Self> {
        let source = post_source_for(&config.posts_path);
        let posts = load_posts(source.as_ref()).with_context(|| {
            format!(
                "failed to load survey posts from {}",
                config.posts_path.display()
            )
        })?;

        let store = store::build_store(&config.store).context("failed to initialize ratings store")?;
        info!(store = %store.describe(), policy = ?config.rating_policy, "ratings store ready");

        Ok(Self::from_parts(
            posts,
            store,
            SessionRegistry::new(config.session_idle),
            config.rating_policy,
        ))
    }

    pub fn from_parts(
        posts: PostSet,
        store: Arc<dyn RatingStore>,
        sessions: SessionRegistry,
        rating_policy: RatingPolicy,
    ) -> Self {
        Self {
            posts: Arc::new(posts),
            store,
            sessions,
            rating_policy,
        }
    }

    pub fn posts(&self) -> &PostSet {
        &self.posts
    }

    pub fn store(&self) -> &dyn RatingStore {
        self.store.as_ref()
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn rating_policy(&self) -> RatingPolicy {
        self.rating_policy
    }
}
