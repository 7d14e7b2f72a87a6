use std::collections::HashMap;

use axum::{
    extract::{Form, State},
    http::StatusCode,
    response::Html,
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use chrono::Utc;
use tracing::warn;

use crate::{
    survey::{
        PostSet, RatingBuffer, RatingChoice, SessionContext, SubmissionOutcome, Submitter,
    },
    web::{
        AppState,
        templates::{Notice, SurveyPage, insight_field, rating_field, render_survey_page},
    },
};

pub const SESSION_COOKIE: &str = "survey_session";
const PARTICIPANT_FIELD: &str = "participant_id";

const SUCCESS_MESSAGE: &str = "Thank you! Your ratings have been submitted.";
const RESUBMITTED_NOTE: &str =
    "Your earlier submission from this session is kept; these ratings were recorded as an additional entry.";
const ALREADY_SUBMITTED_NOTE: &str =
    "You have already submitted ratings in this session. Submitting again records an additional entry.";
const STORE_FAILURE_MESSAGE: &str =
    "Sorry, your ratings could not be saved right now. Your answers are still on this page; please try submitting again.";

pub async fn survey_page(
    State(state): State<AppState>,
    jar: CookieJar,
) -> (CookieJar, Html<String>) {
    let (jar, session) = resolve_session(&state, jar).await;

    let notice = if state.sessions().submissions(&session).await > 0 {
        Some(Notice::Info(ALREADY_SUBMITTED_NOTE.to_string()))
    } else {
        None
    };

    let html = render_survey_page(SurveyPage {
        posts: state.posts().posts(),
        buffer: &RatingBuffer::default(),
        policy: state.rating_policy(),
        notice,
    });
    (jar, Html(html))
}

pub async fn submit_ratings(
    State(state): State<AppState>,
    jar: CookieJar,
    Form(fields): Form<HashMap<String, String>>,
) -> (StatusCode, CookieJar, Html<String>) {
    let (jar, session) = resolve_session(&state, jar).await;
    let buffer = buffer_from_form(state.posts(), &fields);

    let submitter = Submitter::new(state.posts(), state.store(), state.rating_policy());
    let (status, notice) = match submitter.submit(&session, &buffer).await {
        Ok(SubmissionOutcome::Appended { .. }) => {
            let attempt = state.sessions().record_submission(&session).await;
            if attempt > 1 {
                warn!(
                    user_id = %session.user_id,
                    attempt,
                    session_age_secs = (Utc::now() - session.started_at).num_seconds(),
                    "participant resubmitted ratings"
                );
                (
                    StatusCode::OK,
                    Notice::Success(format!("{SUCCESS_MESSAGE} {RESUBMITTED_NOTE}")),
                )
            } else {
                (StatusCode::OK, Notice::Success(SUCCESS_MESSAGE.to_string()))
            }
        }
        Ok(SubmissionOutcome::Rejected(reason)) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Notice::Warning(reason.to_string()),
        ),
        Err(_) => (
            StatusCode::BAD_GATEWAY,
            Notice::Error(STORE_FAILURE_MESSAGE.to_string()),
        ),
    };

    let html = render_survey_page(SurveyPage {
        posts: state.posts().posts(),
        buffer: &buffer,
        policy: state.rating_policy(),
        notice: Some(notice),
    });
    (status, jar, Html(html))
}

async fn resolve_session(state: &AppState, jar: CookieJar) -> (CookieJar, SessionContext) {
    let token = jar.get(SESSION_COOKIE).map(|cookie| cookie.value().to_string());
    let handle = state
        .sessions()
        .ensure_session_identity(token.as_deref())
        .await;

    if !handle.created {
        return (jar, handle.context);
    }

    // No max-age: the identity lasts for the browser session only.
    let mut cookie = Cookie::new(SESSION_COOKIE, handle.context.user_id.to_string());
    cookie.set_path("/");
    cookie.set_http_only(true);
    cookie.set_same_site(SameSite::Lax);
    (jar.add(cookie), handle.context)
}

/// Map submitted form fields onto the loaded posts. Fields for unknown posts are ignored.
fn buffer_from_form(posts: &PostSet, fields: &HashMap<String, String>) -> RatingBuffer {
    let participant_id = fields
        .get(PARTICIPANT_FIELD)
        .map(String::as_str)
        .unwrap_or_default();
    let mut buffer = RatingBuffer::new(participant_id);

    for post in posts.posts() {
        let raw = fields.get(&rating_field(&post.post_id)).map(String::as_str);
        buffer.set_choice(&post.post_id, RatingChoice::from_raw(raw));
        // Browsers omit unchecked checkboxes entirely.
        buffer.set_insight_clicked(
            &post.post_id,
            fields.contains_key(&insight_field(&post.post_id)),
        );
    }

    buffer
}
