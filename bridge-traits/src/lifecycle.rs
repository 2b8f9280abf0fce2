//! Host Visibility Lifecycle
//!
//! Browsers throttle timers in hidden tabs and desktop hosts stop them while
//! the machine sleeps. The session core listens to visibility transitions so
//! it can recompute idle time from the wall clock when the host comes back.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Whether the host surface is currently shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum VisibilityState {
    /// The surface is in front of the user; timers run normally
    #[default]
    Visible,
    /// The surface is hidden or suspended; timers may stall
    Hidden,
}

impl VisibilityState {
    pub fn is_visible(&self) -> bool {
        matches!(self, VisibilityState::Visible)
    }
}

/// Observer for host visibility changes
///
/// # Example
///
/// ```ignore
/// use bridge_traits::lifecycle::{VisibilityObserver, VisibilityState};
///
/// async fn wait_until_visible(observer: &dyn VisibilityObserver) -> Result<()> {
///     let mut changes = observer.subscribe_changes().await?;
///     while let Some(state) = changes.next().await {
///         if state.is_visible() {
///             break;
///         }
///     }
///     Ok(())
/// }
/// ```
#[async_trait]
pub trait VisibilityObserver: Send + Sync {
    /// Current visibility of the host surface
    async fn get_state(&self) -> Result<VisibilityState>;

    /// Stream of subsequent visibility transitions
    async fn subscribe_changes(&self) -> Result<Box<dyn VisibilityChangeStream>>;
}

/// Stream of visibility transitions
#[async_trait]
pub trait VisibilityChangeStream: Send {
    /// Next transition, or `None` once the host stops reporting
    async fn next(&mut self) -> Option<VisibilityState>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_visibility_default_is_visible() {
        assert_eq!(VisibilityState::default(), VisibilityState::Visible);
        assert!(VisibilityState::Visible.is_visible());
        assert!(!VisibilityState::Hidden.is_visible());
    }
}
