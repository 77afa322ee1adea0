// Copyright 2021 Datafuse Labs
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use log::debug;

pub const OVER_TIME_SUFFIX: &str = "_over_time";
const CROSS_SERIES_SUFFIX: &str = "_all";
const WINDOWLESS_FUNCTIONS: [&str; 4] = ["min", "max", "sum", "avg"];

/// Function, step and window requested by the frontend for one select.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectHints {
    pub func: String,
    pub step: i64,
    pub window: i64,
}

/// What actually gets forwarded to the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregationPlan {
    pub function: String,
    pub step: i64,
    pub window: i64,
    pub no_pushdown: bool,
}

/// Pushdown bookkeeping owned by a single querier.
///
/// `config_enabled` comes from adapter configuration, `session_eligible` is
/// set by the caller before each select, and `last_pushed_down` only ever
/// reflects the most recent select on this querier.
#[derive(Debug, Clone, Default)]
pub struct AggregationState {
    config_enabled: bool,
    session_eligible: bool,
    last_pushed_down: Option<String>,
}

impl AggregationState {
    pub fn new(config_enabled: bool) -> Self {
        Self {
            config_enabled,
            ..Self::default()
        }
    }

    pub fn set_session_eligible(&mut self, eligible: bool) {
        self.session_eligible = eligible;
    }

    pub fn eligible(&self) -> bool {
        self.config_enabled && self.session_eligible
    }

    pub fn last_pushed_down(&self) -> Option<&str> {
        self.last_pushed_down.as_deref()
    }

    /// Decides what the engine may aggregate. `requested` is the aggregate
    /// taken from the selector's aggregation label and is only used when no
    /// function-based decision replaces it.
    pub fn plan(&mut self, hints: &SelectHints, requested: &str) -> AggregationPlan {
        let eligible = self.eligible();
        let mut plan = AggregationPlan {
            function: requested.to_string(),
            step: hints.step,
            window: hints.window,
            no_pushdown: false,
        };

        if !hints.func.is_empty() {
            if let Some(base) = hints.func.strip_suffix(OVER_TIME_SUFFIX) {
                if eligible {
                    plan.function = base.to_string();
                } else if hints.step == 0
                    && hints.window == 0
                    && WINDOWLESS_FUNCTIONS.contains(&base)
                {
                    plan.function = base.to_string();
                } else {
                    plan.no_pushdown = true;
                    plan.function.clear();
                }
            } else if eligible {
                plan.function = format!("{}{CROSS_SERIES_SUFFIX}", hints.func);
            }
        }

        if !eligible {
            plan.step = 0;
            plan.window = 0;
        }

        self.last_pushed_down = (!plan.function.is_empty() && !plan.no_pushdown)
            .then(|| hints.func.clone());
        debug!(
            "aggregation plan: hints={hints:?} requested={requested:?} eligible={eligible} plan={plan:?}"
        );
        plan
    }

    /// True when the engine already applied `op` during the last select.
    pub fn is_already_aggregated(&self, op: &str) -> bool {
        self.eligible() && self.last_pushed_down.as_deref() == Some(op)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hints(func: &str, step: i64, window: i64) -> SelectHints {
        SelectHints {
            func: func.into(),
            step,
            window,
        }
    }

    fn state(eligible: bool) -> AggregationState {
        let mut state = AggregationState::new(eligible);
        state.set_session_eligible(true);
        state
    }

    #[test]
    fn eligibility_needs_config_and_session() {
        let mut state = AggregationState::new(true);
        assert!(!state.eligible());
        state.set_session_eligible(true);
        assert!(state.eligible());
        let mut disabled = AggregationState::new(false);
        disabled.set_session_eligible(true);
        assert!(!disabled.eligible());
    }

    #[test]
    fn over_time_pushdown_when_eligible() {
        let plan = state(true).plan(&hints("stddev_over_time", 60, 120), "");
        assert_eq!(
            plan,
            AggregationPlan {
                function: "stddev".into(),
                step: 60,
                window: 120,
                no_pushdown: false,
            }
        );
    }

    #[test]
    fn limited_pushdown_without_windowing() {
        let plan = state(false).plan(&hints("sum_over_time", 0, 0), "");
        assert_eq!(plan.function, "sum");
        assert!(!plan.no_pushdown);
    }

    #[test]
    fn limited_pushdown_rejects_step() {
        let plan = state(false).plan(&hints("sum_over_time", 10, 0), "");
        assert!(plan.no_pushdown);
        assert_eq!(plan.function, "");
        assert_eq!((plan.step, plan.window), (0, 0));
    }

    #[test]
    fn limited_pushdown_rejects_other_functions() {
        let plan = state(false).plan(&hints("count_over_time", 0, 0), "");
        assert!(plan.no_pushdown);
        assert_eq!(plan.function, "");
    }

    #[test]
    fn cross_series_aggregate_when_eligible() {
        let plan = state(true).plan(&hints("count", 30, 0), "");
        assert_eq!(plan.function, "count_all");
        assert_eq!(plan.step, 30);
    }

    #[test]
    fn cross_series_aggregate_needs_eligibility() {
        let plan = state(false).plan(&hints("count", 30, 15), "");
        assert_eq!(plan.function, "");
        assert!(!plan.no_pushdown);
        assert_eq!((plan.step, plan.window), (0, 0));
    }

    #[test]
    fn requested_aggregate_used_without_function() {
        let mut state = state(true);
        let plan = state.plan(&hints("", 60, 0), "max");
        assert_eq!(plan.function, "max");
        assert_eq!(plan.step, 60);
    }

    #[test]
    fn ineligible_query_drops_step_and_window() {
        let plan = state(false).plan(&hints("", 60, 300), "");
        assert_eq!(plan, AggregationPlan::default());
    }

    #[test]
    fn already_aggregated_tracks_last_pushdown() {
        let mut state = state(true);
        state.plan(&hints("sum_over_time", 0, 0), "");
        assert!(state.is_already_aggregated("sum_over_time"));
        assert!(!state.is_already_aggregated("sum"));

        state.plan(&hints("max_over_time", 0, 0), "");
        assert!(!state.is_already_aggregated("sum_over_time"));
        assert!(state.is_already_aggregated("max_over_time"));

        state.plan(&hints("", 0, 0), "");
        assert!(!state.is_already_aggregated("max_over_time"));
        assert_eq!(state.last_pushed_down(), None);
    }

    #[test]
    fn already_aggregated_requires_eligibility() {
        let mut state = state(false);
        let plan = state.plan(&hints("sum_over_time", 0, 0), "");
        assert_eq!(plan.function, "sum");
        assert_eq!(state.last_pushed_down(), Some("sum_over_time"));
        assert!(!state.is_already_aggregated("sum_over_time"));
    }

    #[test]
    fn rejected_pushdown_clears_previous_record() {
        let mut state = state(true);
        state.plan(&hints("avg_over_time", 0, 0), "");
        state.set_session_eligible(false);
        state.plan(&hints("avg_over_time", 5, 0), "");
        assert_eq!(state.last_pushed_down(), None);
    }
}
