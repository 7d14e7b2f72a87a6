use std::collections::HashMap;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    config::RatingPolicy,
    store::{CellValue, RatingStore, SheetRow, StoreError},
    survey::{PostSet, Rating, SessionContext},
};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum ValidationError {
    #[error("Please enter your Participant ID before submitting.")]
    MissingParticipantId,
    #[error("Please choose a rating for every post before submitting (unrated: {}).", format_ranks(.ranks))]
    UnansweredPosts { ranks: Vec<usize> },
    #[error("The rating for post #{rank} is not one of the offered options.")]
    InvalidRating { rank: usize },
}

fn format_ranks(ranks: &[usize]) -> String {
    ranks
        .iter()
        .map(|rank| format!("#{rank}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// What the participant did with one post's rating control.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub enum RatingChoice {
    #[default]
    Unanswered,
    Chosen(Rating),
    Invalid(String),
}

impl RatingChoice {
    pub fn from_raw(raw: Option<&str>) -> Self {
        match raw.map(str::trim) {
            None | Some("") => RatingChoice::Unanswered,
            Some(value) => Rating::parse(value)
                .map(RatingChoice::Chosen)
                .unwrap_or_else(|| RatingChoice::Invalid(value.to_string())),
        }
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PendingRating {
    pub choice: RatingChoice,
    pub insight_clicked: bool,
}

/// Values entered on the form, keyed by `post_id` so they can never drift to
/// another post when the render order changes.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RatingBuffer {
    participant_id: String,
    entries: HashMap<String, PendingRating>,
}

impl RatingBuffer {
    pub fn new(participant_id: impl Into<String>) -> Self {
        Self {
            participant_id: participant_id.into(),
            entries: HashMap::new(),
        }
    }

    pub fn participant_id(&self) -> &str {
        &self.participant_id
    }

    pub fn set_choice(&mut self, post_id: &str, choice: RatingChoice) {
        self.entries.entry(post_id.to_string()).or_default().choice = choice;
    }

    pub fn set_rating(&mut self, post_id: &str, rating: Rating) {
        self.set_choice(post_id, RatingChoice::Chosen(rating));
    }

    pub fn set_insight_clicked(&mut self, post_id: &str, clicked: bool) {
        self.entries
            .entry(post_id.to_string())
            .or_default()
            .insight_clicked = clicked;
    }

    pub fn entry(&self, post_id: &str) -> PendingRating {
        self.entries.get(post_id).cloned().unwrap_or_default()
    }
}

/// One submitted rating, in the column order of the ratings table.
#[derive(Clone, Debug, PartialEq)]
pub struct RatingRecord {
    pub timestamp: DateTime<Utc>,
    pub user_id: Uuid,
    pub participant_id: String,
    pub post_id: String,
    pub rank: usize,
    pub rating: Rating,
    pub ai_insight_clicked: bool,
}

impl RatingRecord {
    pub fn to_row(&self) -> SheetRow {
        vec![
            CellValue::Text(self.timestamp.format(TIMESTAMP_FORMAT).to_string()),
            CellValue::Text(self.user_id.to_string()),
            CellValue::Text(self.participant_id.clone()),
            CellValue::Text(self.post_id.clone()),
            CellValue::Integer(self.rank as i64),
            CellValue::Integer(i64::from(self.rating.value())),
            CellValue::Bool(self.ai_insight_clicked),
        ]
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum SubmissionOutcome {
    /// Nothing was written; the participant has to fix the form.
    Rejected(ValidationError),
    Appended { rows: usize },
}

/// Validates a session's buffered ratings and appends them as one batch.
pub struct Submitter<'a> {
    posts: &'a PostSet,
    store: &'a dyn RatingStore,
    policy: RatingPolicy,
}

impl<'a> Submitter<'a> {
    pub fn new(posts: &'a PostSet, store: &'a dyn RatingStore, policy: RatingPolicy) -> Self {
        Self {
            posts,
            store,
            policy,
        }
    }

    /// Build one record per post in rank order, or explain why the form cannot be submitted.
    pub fn build_records(
        &self,
        session: &SessionContext,
        buffer: &RatingBuffer,
    ) -> Result<Vec<RatingRecord>, ValidationError> {
        let participant_id = buffer.participant_id().trim();
        if participant_id.is_empty() {
            return Err(ValidationError::MissingParticipantId);
        }

        let mut records = Vec::with_capacity(self.posts.len());
        let mut unanswered = Vec::new();
        for post in self.posts.posts() {
            let pending = buffer.entry(&post.post_id);
            let rating = match (&pending.choice, self.policy) {
                (RatingChoice::Chosen(rating), _) => *rating,
                (RatingChoice::Unanswered, RatingPolicy::DefaultToFirst) => Rating::FIRST,
                (RatingChoice::Unanswered, RatingPolicy::RequireExplicit) => {
                    unanswered.push(post.rank);
                    continue;
                }
                (RatingChoice::Invalid(_), _) => {
                    return Err(ValidationError::InvalidRating { rank: post.rank });
                }
            };

            records.push(RatingRecord {
                timestamp: Utc::now(),
                user_id: session.user_id,
                participant_id: participant_id.to_string(),
                post_id: post.post_id.clone(),
                rank: post.rank,
                rating,
                ai_insight_clicked: pending.insight_clicked,
            });
        }

        if !unanswered.is_empty() {
            return Err(ValidationError::UnansweredPosts { ranks: unanswered });
        }
        Ok(records)
    }

    /// Validate and append. Validation problems come back as
    /// [`SubmissionOutcome::Rejected`]; only store failures are errors.
    pub async fn submit(
        &self,
        session: &SessionContext,
        buffer: &RatingBuffer,
    ) -> Result<SubmissionOutcome, StoreError> {
        let records = match self.build_records(session, buffer) {
            Ok(records) => records,
            Err(reason) => {
                warn!(user_id = %session.user_id, %reason, "rejected rating submission");
                return Ok(SubmissionOutcome::Rejected(reason));
            }
        };

        let rows: Vec<SheetRow> = records.iter().map(RatingRecord::to_row).collect();
        if let Err(err) = self.store.append_rows(&rows).await {
            error!(
                ?err,
                user_id = %session.user_id,
                participant_id = buffer.participant_id().trim(),
                store = %self.store.describe(),
                "failed to append ratings"
            );
            return Err(err);
        }

        info!(
            user_id = %session.user_id,
            participant_id = buffer.participant_id().trim(),
            rows = rows.len(),
            store = %self.store.describe(),
            "appended ratings"
        );
        Ok(SubmissionOutcome::Appended { rows: rows.len() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        store::testing::MemoryStore,
        survey::posts::{PostRecord, order_posts},
    };

    fn posts(scores: &[(&str, f64)]) -> PostSet {
        let records = scores
            .iter()
            .map(|(id, score)| PostRecord {
                row: 2,
                post_id: id.to_string(),
                username: "someone".into(),
                text: "post text".into(),
                likes: 0,
                retweets: 0,
                followers: 0,
                following: 0,
                model_score: *score,
                ai_insight: String::new(),
            })
            .collect();
        order_posts(records).unwrap()
    }

    fn session() -> SessionContext {
        SessionContext {
            user_id: Uuid::new_v4(),
            started_at: Utc::now(),
        }
    }

    fn without_timestamp(row: &SheetRow) -> SheetRow {
        row[1..].to_vec()
    }

    #[tokio::test]
    async fn appends_one_row_per_post_in_rank_order() {
        let posts = posts(&[("p1", 0.9), ("p2", 0.95)]);
        let store = MemoryStore::default();
        let session = session();

        let mut buffer = RatingBuffer::new("P100");
        buffer.set_rating("p2", Rating::new(5).unwrap());
        buffer.set_insight_clicked("p2", true);
        buffer.set_rating("p1", Rating::new(2).unwrap());

        let outcome = Submitter::new(&posts, &store, RatingPolicy::DefaultToFirst)
            .submit(&session, &buffer)
            .await
            .unwrap();
        assert_eq!(outcome, SubmissionOutcome::Appended { rows: 2 });

        let batches = store.appended().await;
        assert_eq!(batches.len(), 1);
        let uid = CellValue::Text(session.user_id.to_string());
        let participant = CellValue::Text("P100".into());
        assert_eq!(
            without_timestamp(&batches[0][0]),
            vec![
                uid.clone(),
                participant.clone(),
                CellValue::Text("p2".into()),
                CellValue::Integer(1),
                CellValue::Integer(5),
                CellValue::Bool(true),
            ]
        );
        assert_eq!(
            without_timestamp(&batches[0][1]),
            vec![
                uid,
                participant,
                CellValue::Text("p1".into()),
                CellValue::Integer(2),
                CellValue::Integer(2),
                CellValue::Bool(false),
            ]
        );
    }

    #[tokio::test]
    async fn blank_participant_never_reaches_the_store() {
        let posts = posts(&[("p1", 0.5)]);
        let store = MemoryStore::default();

        for participant in ["", "   "] {
            let mut buffer = RatingBuffer::new(participant);
            buffer.set_rating("p1", Rating::new(4).unwrap());
            let outcome = Submitter::new(&posts, &store, RatingPolicy::DefaultToFirst)
                .submit(&session(), &buffer)
                .await
                .unwrap();
            assert_eq!(
                outcome,
                SubmissionOutcome::Rejected(ValidationError::MissingParticipantId)
            );
        }
        assert!(store.appended().await.is_empty());
    }

    #[test]
    fn untouched_controls_follow_the_policy() {
        let posts = posts(&[("a", 0.3), ("b", 0.2), ("c", 0.1)]);
        let store = MemoryStore::default();
        let session = session();
        let mut buffer = RatingBuffer::new("P7");
        buffer.set_rating("b", Rating::new(3).unwrap());

        let records = Submitter::new(&posts, &store, RatingPolicy::DefaultToFirst)
            .build_records(&session, &buffer)
            .unwrap();
        let ratings: Vec<_> = records.iter().map(|r| r.rating.value()).collect();
        assert_eq!(ratings, vec![1, 3, 1]);

        let err = Submitter::new(&posts, &store, RatingPolicy::RequireExplicit)
            .build_records(&session, &buffer)
            .unwrap_err();
        assert_eq!(err, ValidationError::UnansweredPosts { ranks: vec![1, 3] });
        assert_eq!(
            err.to_string(),
            "Please choose a rating for every post before submitting (unrated: #1, #3)."
        );
    }

    #[test]
    fn tampered_rating_values_are_rejected() {
        let posts = posts(&[("a", 0.3), ("b", 0.2)]);
        let store = MemoryStore::default();
        let mut buffer = RatingBuffer::new("P7");
        buffer.set_choice("b", RatingChoice::from_raw(Some("9")));

        let err = Submitter::new(&posts, &store, RatingPolicy::DefaultToFirst)
            .build_records(&session(), &buffer)
            .unwrap_err();
        assert_eq!(err, ValidationError::InvalidRating { rank: 2 });
    }

    #[test]
    fn repeated_builds_differ_only_in_timestamp() {
        let posts = posts(&[("a", 0.3), ("b", 0.9)]);
        let store = MemoryStore::default();
        let session = session();
        let mut buffer = RatingBuffer::new(" P42 ");
        buffer.set_rating("a", Rating::new(4).unwrap());
        buffer.set_insight_clicked("b", true);

        let submitter = Submitter::new(&posts, &store, RatingPolicy::DefaultToFirst);
        let first = submitter.build_records(&session, &buffer).unwrap();
        let second = submitter.build_records(&session, &buffer).unwrap();

        assert_eq!(first.len(), 2);
        for (a, b) in first.iter().zip(&second) {
            assert_eq!(
                RatingRecord {
                    timestamp: b.timestamp,
                    ..a.clone()
                },
                *b
            );
            assert_eq!(a.participant_id, "P42");
        }
    }

    #[tokio::test]
    async fn store_failures_are_returned_and_buffer_is_untouched() {
        let posts = posts(&[("a", 0.3)]);
        let store = MemoryStore::failing("quota exceeded");
        let mut buffer = RatingBuffer::new("P1");
        buffer.set_rating("a", Rating::new(5).unwrap());
        let before = buffer.clone();

        let err = Submitter::new(&posts, &store, RatingPolicy::DefaultToFirst)
            .submit(&session(), &buffer)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("quota exceeded"));
        assert_eq!(buffer, before);
    }

    #[test]
    fn rows_use_iso_timestamps_without_offset() {
        let record = RatingRecord {
            timestamp: DateTime::parse_from_rfc3339("2024-05-01T10:11:12.345678Z")
                .unwrap()
                .with_timezone(&Utc),
            user_id: Uuid::nil(),
            participant_id: "P1".into(),
            post_id: "p1".into(),
            rank: 1,
            rating: Rating::FIRST,
            ai_insight_clicked: false,
        };
        assert_eq!(
            record.to_row()[0],
            CellValue::Text("2024-05-01T10:11:12.345678".into())
        );
    }
}
