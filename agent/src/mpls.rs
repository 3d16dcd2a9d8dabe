// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! MPLS label types and label actions.

use std::fmt::Display;

use serde::{Deserialize, Serialize};

use crate::errors::AgentError;

/// A 20-bit MPLS label. Label 0 is reserved and not programmable, so the
/// accepted range is [1, 2^20 - 1].
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Label(u32);

impl Label {
    pub const MAX: u32 = 0x000F_FFFF;

    /// # Errors
    /// Fails when the value is 0 or beyond 20 bits.
    pub fn try_new(value: u32) -> Result<Label, AgentError> {
        if value == 0 || value > Self::MAX {
            return Err(AgentError::InvalidLabel(value));
        }
        Ok(Label(value))
    }

    #[must_use]
    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl Display for Label {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An ordered stack of labels to push, outermost first.
#[derive(Debug, Default, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LabelStack(Vec<Label>);

impl LabelStack {
    #[must_use]
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Build a stack from raw label values, validating each.
    ///
    /// # Errors
    /// Fails if any value is outside the programmable range.
    pub fn try_from_raw(labels: &[u32]) -> Result<Self, AgentError> {
        labels.iter().map(|l| Label::try_new(*l)).collect()
    }

    pub fn push(&mut self, label: Label) {
        self.0.push(label);
    }

    /// Compose with an inner stack: `self` stays outermost, `inner` follows.
    #[must_use]
    pub fn compose(&self, inner: &LabelStack) -> LabelStack {
        let mut out = self.clone();
        out.0.extend_from_slice(&inner.0);
        out
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }
    pub fn iter(&self) -> impl Iterator<Item = &Label> {
        self.0.iter()
    }
    #[must_use]
    pub fn labels(&self) -> &[Label] {
        &self.0
    }
}

impl FromIterator<Label> for LabelStack {
    fn from_iter<T: IntoIterator<Item = Label>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Display for LabelStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let labels: Vec<String> = self.0.iter().map(ToString::to_string).collect();
        write!(f, "[{}]", labels.join(","))
    }
}

/// The label operation a resolved label next-hop performs on a packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MplsAction {
    /// Penultimate-hop pop: forward with the top label removed.
    Php,
    /// Replace the top label.
    Swap(Label),
    /// Replace the top label and push the rest of the stack.
    Push(LabelStack),
}

impl MplsAction {
    /// Derive the action a label route's next-hop performs from the label
    /// stack it was submitted with: an empty stack pops, a single label
    /// swaps, a longer stack swaps-and-pushes.
    #[must_use]
    pub fn from_stack(stack: &LabelStack) -> MplsAction {
        match stack.labels() {
            [] => MplsAction::Php,
            [label] => MplsAction::Swap(*label),
            _ => MplsAction::Push(stack.clone()),
        }
    }
}

impl Display for MplsAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MplsAction::Php => write!(f, "php"),
            MplsAction::Swap(label) => write!(f, "swap {label}"),
            MplsAction::Push(stack) => write!(f, "push {stack}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_range() {
        assert!(Label::try_new(0).is_err());
        assert!(Label::try_new(1).is_ok());
        assert!(Label::try_new(Label::MAX).is_ok());
        assert_eq!(
            Label::try_new(1_048_576),
            Err(AgentError::InvalidLabel(1_048_576))
        );
    }

    #[test]
    fn test_stack_compose() {
        let outer = LabelStack::try_from_raw(&[100, 200]).unwrap();
        let inner = LabelStack::try_from_raw(&[300]).unwrap();
        let composed = outer.compose(&inner);
        let raw: Vec<u32> = composed.iter().map(Label::as_u32).collect();
        assert_eq!(raw, [100, 200, 300]);
    }

    #[test]
    fn test_action_from_stack() {
        assert_eq!(MplsAction::from_stack(&LabelStack::new()), MplsAction::Php);
        let swap = LabelStack::try_from_raw(&[42]).unwrap();
        assert_eq!(
            MplsAction::from_stack(&swap),
            MplsAction::Swap(Label::try_new(42).unwrap())
        );
        let push = LabelStack::try_from_raw(&[42, 43]).unwrap();
        assert!(matches!(MplsAction::from_stack(&push), MplsAction::Push(_)));
    }
}
