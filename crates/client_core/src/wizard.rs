//! Starter-pack wizard.
//!
//! Defines a pure reducer over [`WizardState`] and a small state holder the UI
//! dispatches actions into.

use serde::Serialize;
use shared::{
    domain::{AtUri, Did, FeedSummary, ProfileSummary},
    protocol::RepoRecord,
};
use tracing::debug;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum WizardStep {
    #[default]
    Details,
    Profiles,
    Feeds,
}

const STEPS: [WizardStep; 3] = [WizardStep::Details, WizardStep::Profiles, WizardStep::Feeds];

impl WizardStep {
    fn index(self) -> usize {
        match self {
            Self::Details => 0,
            Self::Profiles => 1,
            Self::Feeds => 2,
        }
    }

    pub fn next(self) -> Option<Self> {
        STEPS.get(self.index() + 1).copied()
    }

    pub fn previous(self) -> Option<Self> {
        self.index().checked_sub(1).map(|i| STEPS[i])
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum TransitionDirection {
    #[default]
    Forward,
    Backward,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WizardState {
    pub current_step: WizardStep,
    pub can_next: bool,
    pub name: Option<String>,
    pub description: Option<String>,
    pub profiles: Vec<ProfileSummary>,
    pub feeds: Vec<FeedSummary>,
    pub processing: bool,
    pub error: Option<String>,
    pub transition_direction: TransitionDirection,
    pub target_did: Option<Did>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WizardAction {
    Next,
    Back,
    /// Accepted for completeness; the validity pass always recomputes `can_next`.
    SetCanNext(bool),
    SetName(String),
    SetDescription(String),
    /// Appends unconditionally. Callers check [`WizardController::has_profile`] first.
    AddProfile(ProfileSummary),
    RemoveProfile(Did),
    AddFeed(FeedSummary),
    RemoveFeed(AtUri),
    SetProcessing(bool),
    SetError(Option<String>),
}

/// An existing starter pack being edited, with its hydrated members and feeds.
#[derive(Debug, Clone)]
pub struct StarterPackSeed {
    pub record: RepoRecord,
    pub profiles: Vec<ProfileSummary>,
    pub feeds: Vec<FeedSummary>,
}

/// Builds the state a wizard mounts with.
///
/// `can_next` always starts false, even when a seeded description would make
/// the Details step valid; the first dispatched action recomputes it.
pub fn initial_state(seed: Option<StarterPackSeed>, target: Option<ProfileSummary>) -> WizardState {
    let target_did = target.as_ref().map(|p| p.did.clone());

    match seed {
        Some(StarterPackSeed {
            record: RepoRecord::StarterPack(record),
            profiles,
            feeds,
        }) => WizardState {
            name: Some(record.name),
            description: record.description,
            profiles,
            feeds,
            target_did,
            ..WizardState::default()
        },
        _ => WizardState {
            profiles: target.into_iter().collect(),
            target_did,
            ..WizardState::default()
        },
    }
}

pub fn reduce(state: WizardState, action: WizardAction) -> WizardState {
    let mut next = navigate(state, &action);

    match action {
        WizardAction::SetName(name) => next.name = Some(name),
        WizardAction::SetDescription(description) => next.description = Some(description),
        WizardAction::AddProfile(profile) => next.profiles.push(profile),
        WizardAction::RemoveProfile(did) => next.profiles.retain(|p| p.did != did),
        WizardAction::AddFeed(feed) => next.feeds.push(feed),
        WizardAction::RemoveFeed(uri) => next.feeds.retain(|f| f.uri != uri),
        WizardAction::SetProcessing(processing) => next.processing = processing,
        WizardAction::SetError(error) => next.error = error,
        WizardAction::Next | WizardAction::Back | WizardAction::SetCanNext(_) => {}
    }

    next.can_next = match next.current_step {
        WizardStep::Details => next.description.as_deref().is_some_and(|d| !d.is_empty()),
        WizardStep::Profiles | WizardStep::Feeds => true,
    };
    next
}

fn navigate(mut state: WizardState, action: &WizardAction) -> WizardState {
    let moved = match action {
        WizardAction::Next => state
            .current_step
            .next()
            .map(|step| (step, TransitionDirection::Forward)),
        WizardAction::Back => state
            .current_step
            .previous()
            .map(|step| (step, TransitionDirection::Backward)),
        _ => None,
    };
    if let Some((step, direction)) = moved {
        state.current_step = step;
        state.transition_direction = direction;
    }
    state
}

/// Owns the wizard state for the lifetime of one wizard screen.
#[derive(Debug, Clone, Default)]
pub struct WizardController {
    state: WizardState,
}

impl WizardController {
    pub fn new(seed: Option<StarterPackSeed>, target: Option<ProfileSummary>) -> Self {
        Self::from_state(initial_state(seed, target))
    }

    pub fn from_state(state: WizardState) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &WizardState {
        &self.state
    }

    pub fn into_state(self) -> WizardState {
        self.state
    }

    pub fn dispatch(&mut self, action: WizardAction) -> &WizardState {
        let state = std::mem::take(&mut self.state);
        self.state = reduce(state, action);
        debug!(
            step = ?self.state.current_step,
            can_next = self.state.can_next,
            profiles = self.state.profiles.len(),
            feeds = self.state.feeds.len(),
            "wizard: action applied"
        );
        &self.state
    }

    pub fn is_first_step(&self) -> bool {
        self.state.current_step.previous().is_none()
    }

    pub fn is_last_step(&self) -> bool {
        self.state.current_step.next().is_none()
    }

    pub fn has_profile(&self, did: &Did) -> bool {
        self.state.profiles.iter().any(|p| &p.did == did)
    }

    pub fn has_feed(&self, uri: &AtUri) -> bool {
        self.state.feeds.iter().any(|f| &f.uri == uri)
    }
}

#[cfg(test)]
#[path = "tests/wizard_tests.rs"]
mod tests;
