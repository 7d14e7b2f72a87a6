pub mod insight;
pub mod posts;
pub mod session;
pub mod submission;

pub use posts::{Post, PostSet, load_posts};
pub use session::{SessionContext, SessionRegistry};
pub use submission::{RatingBuffer, RatingChoice, SubmissionOutcome, Submitter};

/// A check-worthiness rating on the 1-5 scale.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct Rating(u8);

impl Rating {
    pub const ALL: [Rating; 5] = [Rating(1), Rating(2), Rating(3), Rating(4), Rating(5)];
    /// Option pre-selected when the participant never touches the control.
    pub const FIRST: Rating = Rating(1);

    pub fn new(value: u8) -> Option<Self> {
        (1..=5).contains(&value).then_some(Self(value))
    }

    pub fn parse(raw: &str) -> Option<Self> {
        raw.trim().parse::<u8>().ok().and_then(Self::new)
    }

    pub fn value(self) -> u8 {
        self.0
    }

    pub fn label(self) -> &'static str {
        match self.0 {
            1 => "Definitely not",
            2 => "Probably not",
            3 => "Not sure",
            4 => "Probably yes",
            _ => "Definitely yes",
        }
    }
}
