pub mod domain;
pub mod history;
pub mod repository;
mod store;

pub use domain::{
    classify, sanitize_text, Bottle, BottleContent, BottleId, BottleKind, Comment, CommentRemoval,
    Created, Draft, Requester,
};
pub use history::RetrievalHistory;
pub use repository::{BottleRepository, LoadCounts};
pub use store::{BottleStore, HistoryItem, LoadReport};
