use chrono::{Datelike, Utc};

use crate::{
    config::RatingPolicy,
    survey::{Post, Rating, RatingBuffer, RatingChoice},
    utils::html::escape_html,
};

pub const PAGE_TITLE: &str = "Which Posts Should Be Fact-Checked?";
pub const PAGE_HEADING: &str = "FactCheck-Worthiness Review Task";
pub const RATING_QUESTION: &str = "Would you recommend this post for fact-checking?";
pub const INSIGHT_CHECKBOX_LABEL: &str = "Did you view the AI insight for this post?";
pub const NO_INSIGHT_MESSAGE: &str = "No insight available for this post.";

const SURVEY_PAGE_STYLES: &str = r#"
        :root { color-scheme: light; }
        body { font-family: "Helvetica Neue", Arial, sans-serif; margin: 0; background: #f8fafc; color: #0f172a; }
        header { background: #ffffff; padding: 2rem 1.5rem; border-bottom: 1px solid #e2e8f0; }
        header h1 { max-width: 760px; margin: 0 auto; }
        main { padding: 2rem 1.5rem; max-width: 760px; margin: 0 auto; box-sizing: border-box; }
        .panel { background: #ffffff; border-radius: 12px; border: 1px solid #e2e8f0; padding: 1.5rem; box-shadow: 0 18px 40px rgba(15, 23, 42, 0.08); margin-bottom: 1.5rem; }
        label { font-weight: 600; color: #0f172a; }
        input[type="text"] { width: 100%; padding: 0.75rem; margin-top: 0.5rem; border-radius: 8px; border: 1px solid #cbd5f5; background: #f8fafc; color: #0f172a; box-sizing: border-box; font-size: 1rem; }
        input[type="text"]:focus { outline: none; border-color: #2563eb; box-shadow: 0 0 0 3px rgba(37, 99, 235, 0.12); }
        input[type="checkbox"], input[type="radio"] { margin-right: 0.5rem; }
        .note { color: #475569; font-size: 0.95rem; line-height: 1.6; }
        .post-card h3 { margin-top: 0; }
        .post-meta { color: #334155; font-size: 0.92rem; }
        .post-text { line-height: 1.6; }
        .checkbox { display: block; margin: 1rem 0 0.5rem; font-weight: 500; }
        details.insight { background: #f1f5f9; border-radius: 8px; padding: 0.75rem 1rem; margin-bottom: 1rem; }
        details.insight summary { cursor: pointer; font-weight: 600; color: #1d4ed8; }
        fieldset.rating { border: 1px solid #e2e8f0; border-radius: 8px; padding: 0.75rem 1rem; }
        fieldset.rating legend { font-weight: 600; padding: 0 0.35rem; }
        fieldset.rating label { display: block; font-weight: 400; padding: 0.25rem 0; }
        button { padding: 0.85rem 1.2rem; border: none; border-radius: 8px; background: #2563eb; color: #ffffff; font-weight: 600; cursor: pointer; transition: background 0.15s ease; font-size: 1rem; }
        button:hover { background: #1d4ed8; }
        .status-box { margin-bottom: 1.5rem; padding: 1rem; border-radius: 12px; }
        .status-box.warning { background: #fef3c7; color: #92400e; }
        .status-box.error { background: #fee2e2; color: #b91c1c; }
        .status-box.success { background: #dcfce7; color: #166534; }
        .status-box.info { background: #e0f2fe; color: #1d4ed8; }
        .app-footer { margin-top: 3rem; text-align: center; font-size: 0.85rem; color: #94a3b8; }
        @media (max-width: 768px) {
            header { padding: 1.5rem 1rem; }
            main { padding: 1.5rem 1rem; }
        }
"#;

/// Message box shown above the form.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Notice {
    Info(String),
    Success(String),
    Warning(String),
    Error(String),
}

impl Notice {
    fn class(&self) -> &'static str {
        match self {
            Notice::Info(_) => "info",
            Notice::Success(_) => "success",
            Notice::Warning(_) => "warning",
            Notice::Error(_) => "error",
        }
    }

    fn message(&self) -> &str {
        match self {
            Notice::Info(message)
            | Notice::Success(message)
            | Notice::Warning(message)
            | Notice::Error(message) => message,
        }
    }
}

pub struct SurveyPage<'a> {
    pub posts: &'a [Post],
    pub buffer: &'a RatingBuffer,
    pub policy: RatingPolicy,
    pub notice: Option<Notice>,
}

pub fn rating_field(post_id: &str) -> String {
    format!("rating_{post_id}")
}

pub fn insight_field(post_id: &str) -> String {
    format!("insight_click_{post_id}")
}

pub fn render_survey_page(page: SurveyPage<'_>) -> String {
    let SurveyPage {
        posts,
        buffer,
        policy,
        notice,
    } = page;

    let notice_html = notice
        .map(|notice| {
            format!(
                r#"<div class="status-box {class}" role="status">{message}</div>"#,
                class = notice.class(),
                message = escape_html(notice.message()),
            )
        })
        .unwrap_or_default();

    let post_sections = posts
        .iter()
        .map(|post| render_post(post, buffer, policy))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <title>{title}</title>
    <meta name="viewport" content="width=device-width, initial-scale=1">
    <meta name="robots" content="noindex,nofollow">
    <style>
{styles}
    </style>
</head>
<body>
    <header>
        <h1>{heading}</h1>
    </header>
    <main>
        {notice_html}
        <form method="post" action="/submit">
            <section class="panel">
                <label for="participant_id">Please enter your Participant ID (required to proceed):</label>
                <input id="participant_id" type="text" name="participant_id" value="{participant_id}" autocomplete="off">
                <p class="note">These posts have been ranked by an AI model based on their check-worthiness.
                Please review each post and rate how check-worthy <em>you</em> think it is on a scale of 1 to 5.
                You may optionally view the AI's reasoning by clicking <strong>"Show AI Insight"</strong>.</p>
            </section>
{post_sections}
            <button type="submit">Submit Ratings</button>
        </form>
        {footer}
    </main>
</body>
</html>"#,
        title = PAGE_TITLE,
        styles = SURVEY_PAGE_STYLES,
        heading = PAGE_HEADING,
        notice_html = notice_html,
        participant_id = escape_html(buffer.participant_id()),
        post_sections = post_sections,
        footer = render_footer(),
    )
}

fn render_post(post: &Post, buffer: &RatingBuffer, policy: RatingPolicy) -> String {
    let pending = buffer.entry(&post.post_id);
    let selected = match (&pending.choice, policy) {
        (RatingChoice::Chosen(rating), _) => Some(*rating),
        (_, RatingPolicy::DefaultToFirst) => Some(Rating::FIRST),
        (_, RatingPolicy::RequireExplicit) => None,
    };
    let field_id = escape_html(&post.post_id);

    let options = Rating::ALL
        .iter()
        .map(|rating| {
            format!(
                r#"<label><input type="radio" name="{name}" value="{value}"{checked}> {label}</label>"#,
                name = escape_html(&rating_field(&post.post_id)),
                value = rating.value(),
                checked = if selected == Some(*rating) { " checked" } else { "" },
                label = rating.label(),
            )
        })
        .collect::<Vec<_>>()
        .join("\n                    ");

    let insight_html = if post.insight.is_empty() {
        format!("<p><em>{NO_INSIGHT_MESSAGE}</em></p>")
    } else {
        post.insight
            .iter()
            .map(|entry| {
                format!(
                    "<p><strong>{}:</strong> {}</p>",
                    escape_html(&entry.title),
                    escape_html(&entry.description)
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    };

    format!(
        r#"            <section class="panel post-card" data-post-id="{field_id}">
                <h3>Rank #{rank}</h3>
                <p class="post-meta"><strong>@{username}</strong> &nbsp;|&nbsp; <strong>Likes:</strong> {likes} &nbsp;|&nbsp; <strong>Retweets:</strong> {retweets} &nbsp;|&nbsp; <strong>Followers:</strong> {followers} &nbsp;|&nbsp; <strong>Following:</strong> {following}</p>
                <p class="post-text"><strong>Post:</strong> {text}</p>
                <label class="checkbox"><input type="checkbox" name="{insight_name}"{insight_checked}> {insight_label}</label>
                <details class="insight">
                    <summary>Show AI Insight</summary>
                    {insight_html}
                </details>
                <fieldset class="rating">
                    <legend>{question}</legend>
                    {options}
                </fieldset>
            </section>"#,
        field_id = field_id,
        rank = post.rank,
        username = escape_html(&post.username),
        likes = post.likes,
        retweets = post.retweets,
        followers = post.followers,
        following = post.following,
        text = post.display_text,
        insight_name = escape_html(&insight_field(&post.post_id)),
        insight_checked = if pending.insight_clicked { " checked" } else { "" },
        insight_label = INSIGHT_CHECKBOX_LABEL,
        insight_html = insight_html,
        question = RATING_QUESTION,
        options = options,
    )
}

pub fn render_footer() -> String {
    let current_year = Utc::now().year();
    format!(
        r#"<footer class="app-footer">© {year} FactCheck-Worthiness Review. Responses are used for research purposes only.</footer>"#,
        year = current_year
    )
}
