use client_core::ExplanationState;
use shared::domain::ExplanationGeneration;

/// How much of the current explanation reveal has reached the terminal.
///
/// Appended characters arrive as events; after the event stream lags, the
/// missing part is taken from a session snapshot and later duplicates are skipped.
#[derive(Debug, Default)]
pub struct RevealCursor {
    generation: Option<ExplanationGeneration>,
    printed: usize,
}

impl RevealCursor {
    /// Returns `false` for an older generation than the one being followed.
    fn follow(&mut self, generation: ExplanationGeneration) -> bool {
        match self.generation {
            Some(current) if current > generation => false,
            Some(current) if current == generation => true,
            _ => {
                self.generation = Some(generation);
                self.printed = 0;
                true
            }
        }
    }

    /// The character to print for one appended event, if it has not been printed yet.
    pub fn append(
        &mut self,
        generation: ExplanationGeneration,
        index: usize,
        ch: char,
    ) -> Option<char> {
        if !self.follow(generation) || index != self.printed {
            return None;
        }
        self.printed += 1;
        Some(ch)
    }

    /// The revealed text that was never printed.
    pub fn resync(
        &mut self,
        generation: ExplanationGeneration,
        state: &ExplanationState,
    ) -> String {
        let ExplanationState::Shown(reveal) = state else {
            return String::new();
        };
        if !self.follow(generation) {
            return String::new();
        }
        let missing: String = reveal.visible().chars().skip(self.printed).collect();
        self.printed += missing.chars().count();
        missing
    }
}
