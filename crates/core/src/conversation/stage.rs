use crate::message::Message;

use super::{ConversationState, TurnError};

/// Which earlier turns are replayed as separate user/assistant messages.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Replay {
    /// Every earlier pair, folded or not.
    AllPrior,
    /// Only the earlier pairs whose output is not folded into this stage.
    ExceptFolded,
}

/// An earlier stage output quoted under `header` in the current user message.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Fold {
    pub stage: usize,
    pub header: &'static str,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StageSpec {
    pub name: &'static str,
    pub replay: Replay,
    pub folds: &'static [Fold],
    pub in_story: bool,
}

pub const INTRO_HEADER: &str = "【导语】";
pub const OUTLINE_HEADER: &str = "【剧情大纲】";

const CANONICAL_STAGES: [StageSpec; 5] = [
    StageSpec {
        name: "仿写导语",
        replay: Replay::AllPrior,
        folds: &[],
        in_story: true,
    },
    StageSpec {
        name: "剧情大纲",
        replay: Replay::AllPrior,
        folds: &[Fold {
            stage: 0,
            header: INTRO_HEADER,
        }],
        in_story: false,
    },
    StageSpec {
        name: "正文1-4章",
        replay: Replay::AllPrior,
        folds: &[
            Fold {
                stage: 0,
                header: INTRO_HEADER,
            },
            Fold {
                stage: 1,
                header: OUTLINE_HEADER,
            },
        ],
        in_story: true,
    },
    StageSpec {
        name: "正文5-7章",
        replay: Replay::AllPrior,
        folds: &[],
        in_story: true,
    },
    StageSpec {
        name: "正文8-10章",
        replay: Replay::AllPrior,
        folds: &[],
        in_story: true,
    },
];

const INTRO_ONLY_STAGES: [StageSpec; 1] = [StageSpec {
    name: "仿写导语",
    replay: Replay::AllPrior,
    folds: &[],
    in_story: true,
}];

/// The fixed table of stage rules a run walks through, indexed by stage.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct StagePlan {
    stages: &'static [StageSpec],
}

impl StagePlan {
    /// Intro rewrite, plot outline, then three rounds of chapter drafts.
    pub fn canonical() -> Self {
        Self {
            stages: &CANONICAL_STAGES,
        }
    }

    /// A single intro rewrite; its output is the whole result.
    pub fn intro_only() -> Self {
        Self {
            stages: &INTRO_ONLY_STAGES,
        }
    }

    pub const fn new(stages: &'static [StageSpec]) -> Self {
        Self { stages }
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn get(&self, stage: usize) -> Option<&'static StageSpec> {
        self.stages.get(stage)
    }

    pub fn stages(&self) -> &'static [StageSpec] {
        self.stages
    }

    pub fn stage_name(&self, stage: usize) -> &'static str {
        self.get(stage).map(|spec| spec.name).unwrap_or("未知阶段")
    }
}

impl Default for StagePlan {
    fn default() -> Self {
        Self::canonical()
    }
}

/// Messages for one stage plus the user text actually sent in it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Turn {
    pub stage: usize,
    pub messages: Vec<Message>,
    pub composed_input: String,
}

/// Composes the user text for `stage`: each folded output under its header,
/// then the raw stage input.
pub fn compose_input(
    spec: &StageSpec,
    state: &ConversationState,
    stage: usize,
) -> Result<String, TurnError> {
    let raw = state
        .user_input(stage)
        .ok_or(TurnError::MissingInput { stage })?;
    let mut composed = String::new();
    for fold in spec.folds {
        if fold.stage >= stage {
            return Err(TurnError::InvalidFold {
                stage,
                source_stage: fold.stage,
            });
        }
        let output = state.output(fold.stage).ok_or(TurnError::MissingOutput {
            stage,
            prior: fold.stage,
        })?;
        composed.push_str(fold.header);
        composed.push_str("：\n");
        composed.push_str(output);
        composed.push('\n');
    }
    composed.push_str(raw);
    Ok(composed)
}

/// Builds the ordered message list for `stage` without touching `state`.
pub fn build_turn(
    plan: &StagePlan,
    state: &ConversationState,
    stage: usize,
) -> Result<Turn, TurnError> {
    let spec = plan.get(stage).ok_or(TurnError::UnknownStage {
        stage,
        count: plan.len(),
    })?;
    if state.completed_stages() < stage {
        return Err(TurnError::MissingOutput {
            stage,
            prior: state.completed_stages(),
        });
    }

    let composed_input = compose_input(spec, state, stage)?;
    let mut messages = replay_messages(plan, state, stage)?;
    messages.push(Message::user(composed_input.clone()));

    Ok(Turn {
        stage,
        messages,
        composed_input,
    })
}

/// The system message followed by the earlier pairs `stage` replays.
pub fn replay_messages(
    plan: &StagePlan,
    state: &ConversationState,
    stage: usize,
) -> Result<Vec<Message>, TurnError> {
    let spec = plan.get(stage).ok_or(TurnError::UnknownStage {
        stage,
        count: plan.len(),
    })?;
    let mut messages = Vec::with_capacity(2 * stage + 2);
    messages.push(Message::system(state.system_prompt()));
    for prior in 0..stage {
        if spec.replay == Replay::ExceptFolded && spec.folds.iter().any(|f| f.stage == prior) {
            continue;
        }
        let input = state
            .user_input(prior)
            .ok_or(TurnError::MissingInput { stage: prior })?;
        let output = state
            .output(prior)
            .ok_or(TurnError::MissingOutput { stage, prior })?;
        messages.push(Message::user(input));
        messages.push(Message::assistant(output));
    }
    Ok(messages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Role;

    fn state_with_outputs(count: usize) -> ConversationState {
        let mut state = ConversationState::new(
            "系统提示",
            (1..=5).map(|i| format!("U{i}")).collect::<Vec<_>>(),
        );
        for stage in 0..count {
            state
                .record_output(stage, format!("sent{stage}"), format!("A{}", stage + 1))
                .unwrap();
        }
        state
    }

    #[test]
    fn stage_zero_is_system_plus_raw_input() {
        let state = state_with_outputs(0);
        let turn = build_turn(&StagePlan::canonical(), &state, 0).unwrap();
        assert_eq!(
            turn.messages,
            vec![Message::system("系统提示"), Message::user("U1")]
        );
        assert_eq!(turn.composed_input, "U1");
    }

    #[test]
    fn intro_only_plan_is_one_story_stage() {
        let plan = StagePlan::intro_only();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.stage_name(0), "仿写导语");

        let mut state = ConversationState::new("系统提示", ["U1"]);
        let turn = build_turn(&plan, &state, 0).unwrap();
        assert_eq!(turn.messages.len(), 2);
        state.record_output(0, turn.composed_input, "A1").unwrap();
        assert_eq!(state.story_text(&plan), "A1");
        assert!(matches!(
            build_turn(&plan, &state, 1),
            Err(TurnError::UnknownStage { stage: 1, count: 1 })
        ));
    }

    #[test]
    fn outline_stage_replays_intro_and_folds_it() {
        let state = state_with_outputs(1);
        let turn = build_turn(&StagePlan::canonical(), &state, 1).unwrap();
        assert_eq!(
            turn.messages,
            vec![
                Message::system("系统提示"),
                Message::user("U1"),
                Message::assistant("A1"),
                Message::user("【导语】：\nA1\nU2"),
            ]
        );
    }

    #[test]
    fn first_draft_stage_folds_intro_and_outline() {
        let state = state_with_outputs(2);
        let turn = build_turn(&StagePlan::canonical(), &state, 2).unwrap();
        assert_eq!(turn.messages.len(), 6);
        assert_eq!(turn.composed_input, "【导语】：\nA1\n【剧情大纲】：\nA2\nU3");
        assert_eq!(turn.messages[3], Message::user("U2"));
    }

    #[test]
    fn later_stages_replay_raw_inputs_and_send_verbatim_text() {
        let state = state_with_outputs(4);
        let turn = build_turn(&StagePlan::canonical(), &state, 4).unwrap();
        assert_eq!(turn.messages.len(), 10);
        assert_eq!(turn.messages[0].role, Role::System);
        let roles: Vec<Role> = turn.messages[1..].iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![
                Role::User,
                Role::Assistant,
                Role::User,
                Role::Assistant,
                Role::User,
                Role::Assistant,
                Role::User,
                Role::Assistant,
                Role::User,
            ]
        );
        assert_eq!(turn.messages[5], Message::user("U3"));
        assert_eq!(turn.messages[9], Message::user("U5"));
    }

    #[test]
    fn every_stage_starts_with_one_system_message() {
        let state = state_with_outputs(4);
        let plan = StagePlan::canonical();
        for stage in 0..plan.len() {
            let turn = build_turn(&plan, &state, stage).unwrap();
            assert_eq!(turn.messages[0], Message::system("系统提示"));
            assert_eq!(
                turn.messages
                    .iter()
                    .filter(|m| m.role == Role::System)
                    .count(),
                1
            );
        }
    }

    #[test]
    fn building_twice_is_identical_and_does_not_mutate() {
        let state = state_with_outputs(3);
        let before = state.clone();
        let plan = StagePlan::canonical();
        let first = build_turn(&plan, &state, 3).unwrap();
        let second = build_turn(&plan, &state, 3).unwrap();
        assert_eq!(first, second);
        assert_eq!(state, before);
    }

    #[test]
    fn missing_prior_output_is_rejected() {
        let state = state_with_outputs(1);
        let err = build_turn(&StagePlan::canonical(), &state, 3).unwrap_err();
        assert!(matches!(err, TurnError::MissingOutput { stage: 3, .. }));
    }

    #[test]
    fn unknown_stage_is_rejected() {
        let state = state_with_outputs(4);
        let err = build_turn(&StagePlan::canonical(), &state, 5).unwrap_err();
        assert!(matches!(err, TurnError::UnknownStage { stage: 5, count: 5 }));
    }

    static FOLD_ONLY: [StageSpec; 2] = [
        StageSpec {
            name: "导语",
            replay: Replay::ExceptFolded,
            folds: &[],
            in_story: true,
        },
        StageSpec {
            name: "大纲",
            replay: Replay::ExceptFolded,
            folds: &[Fold {
                stage: 0,
                header: INTRO_HEADER,
            }],
            in_story: true,
        },
    ];

    #[test]
    fn except_folded_replay_skips_folded_pairs() {
        let mut state = ConversationState::new("系统", vec!["U1".to_string(), "U2".to_string()]);
        state.record_output(0, "U1", "A1").unwrap();
        let turn = build_turn(&StagePlan::new(&FOLD_ONLY), &state, 1).unwrap();
        assert_eq!(
            turn.messages,
            vec![Message::system("系统"), Message::user("【导语】：\nA1\nU2")]
        );
    }
}
