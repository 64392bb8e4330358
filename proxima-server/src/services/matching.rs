use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use metrics::counter;
use uuid::Uuid;

use proxima_shared::errors::{AppError, ErrorCode};

use crate::models::{LikeOutcome, MatchView, ProfileView};
use crate::store::{run_blocking, LikeStore, UserStore};

/// Directed likes and the mutual matches derived from them.
pub struct MatchEngine {
    likes: Arc<dyn LikeStore>,
    users: Arc<dyn UserStore>,
}

impl MatchEngine {
    pub fn new(likes: Arc<dyn LikeStore>, users: Arc<dyn UserStore>) -> Self {
        Self { likes, users }
    }

    pub async fn like(&self, liker: Uuid, liked: Uuid) -> Result<LikeOutcome, AppError> {
        if liker == liked {
            return Err(AppError::new(ErrorCode::CannotLikeSelf, "you cannot like yourself"));
        }

        let users = self.users.clone();
        let found = run_blocking(move || users.find_many(&[liker, liked])).await?;
        if found.len() < 2 {
            return Err(AppError::new(ErrorCode::UserNotFound, "user not found"));
        }

        // The store call runs to completion even if this request is dropped.
        let likes = self.likes.clone();
        let outcome = run_blocking(move || likes.like(liker, liked, Utc::now())).await?;

        counter!("likes_total").increment(1);
        if outcome.new_match {
            counter!("matches_total").increment(1);
            tracing::info!(liker = %liker, liked = %liked, "new match");
        } else {
            tracing::debug!(liker = %liker, liked = %liked, matched = outcome.matched, "like recorded");
        }
        Ok(outcome)
    }

    /// Profiles of everyone `user_id` has matched with, most recent first.
    pub async fn list_matches(&self, user_id: Uuid) -> Result<Vec<MatchView>, AppError> {
        let likes = self.likes.clone();
        let users = self.users.clone();
        let (edges, partners) = run_blocking(move || {
            let edges = likes.matches_of(user_id)?;
            let ids: Vec<Uuid> = edges.iter().map(|e| e.partner_id).collect();
            let partners: HashMap<Uuid, _> = users.find_many(&ids)?.into_iter().map(|u| (u.id, u)).collect();
            Ok((edges, partners))
        })
        .await?;

        Ok(edges
            .into_iter()
            .filter_map(|edge| {
                partners.get(&edge.partner_id).map(|user| MatchView {
                    profile: ProfileView::public(user),
                    matched_at: edge.matched_at,
                })
            })
            .collect())
    }
}
