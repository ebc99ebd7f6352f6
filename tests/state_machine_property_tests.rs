//! Property-based tests for the approval instance state machine
//!
//! Random workflows are driven by random sequences of approver actions. Each
//! action goes through the same precheck, authorize and apply sequence the
//! service uses, with every user active, so these tests exercise the step
//! logic without a database.
//!
//! Invariants checked after every sequence:
//!
//! - the current step never moves backwards and always exists
//! - a finished instance never changes again
//! - no user decides twice on the same step
//! - every passed step was satisfied according to its approval mode
//! - comments never change state

use proptest::prelude::*;
use wps_approval::{
    definition::{ApprovalMode, ApproverRule, NewWorkflowDefinition, StepDefinition, WorkflowDefinition},
    error::ApprovalError,
    instance::{Action, ApprovalInstance, Decision, InstanceStatus, NewInstance, StepState, Transition},
    resolver::EffectiveApprovers,
    types::{DocumentType, TimeStamp},
};

const SUBMITTER: u64 = 50;

fn step_strategy() -> impl Strategy<Value = StepDefinition> {
    (
        prop::collection::btree_set(1u64..=6, 1..=3),
        any::<bool>(),
    )
        .prop_map(|(users, all)| {
            let mode = if all { ApprovalMode::All } else { ApprovalMode::Any };
            StepDefinition::new("Step", ApproverRule::Users(users.into_iter().collect())).set_mode(mode)
        })
}

fn definition_strategy() -> impl Strategy<Value = WorkflowDefinition> {
    prop::collection::vec(step_strategy(), 1..=4).prop_map(|steps| {
        let draft = steps
            .into_iter()
            .fold(NewWorkflowDefinition::new("Review", "review", DocumentType::Wps), |d, s| d.step(s));
        let now = TimeStamp::now();
        WorkflowDefinition {
            id: 1,
            name: draft.name.clone(),
            code: draft.code.clone(),
            document_type: draft.document_type,
            company_id: None,
            is_active: true,
            is_default: true,
            steps: draft.validate_and_finalise().expect("generated steps are valid"),
            version: 1,
            created_at: now,
            updated_at: now,
        }
    })
}

/// (actor, action) pairs. Actors range over the approver pool plus one
/// outsider (7) and the submitter.
fn actions_strategy() -> impl Strategy<Value = Vec<(u64, Action)>> {
    let actor = prop_oneof![1u64..=7, Just(SUBMITTER)];
    let action = prop_oneof![
        4 => Just(Action::Approve),
        1 => Just(Action::Reject),
        1 => Just(Action::Comment),
        1 => (1u64..=9).prop_map(|to| Action::Delegate { to }),
    ];
    prop::collection::vec((actor, action), 0..40)
}

fn submit(definition: &WorkflowDefinition) -> ApprovalInstance {
    let first = match &definition.steps[0].approvers {
        ApproverRule::Users(ids) => ids.clone(),
        ApproverRule::Role(_) => vec![],
    };
    ApprovalInstance::submit(NewInstance {
        id: 1,
        definition,
        document_id: 1,
        company_id: None,
        factory_id: None,
        submitter_id: SUBMITTER,
        first_step_approvers: first,
        now: TimeStamp::now(),
    })
    .expect("definition has steps")
}

fn snapshot_of(instance: &ApprovalInstance) -> EffectiveApprovers {
    EffectiveApprovers {
        approvers: instance.current().map(|s| s.eligible.clone()).unwrap_or_default(),
        refreshed: false,
    }
}

/// Runs one action the way the service does. Returns the transition if it was accepted.
fn step(instance: &mut ApprovalInstance, actor: u64, action: Action) -> Result<Transition, ApprovalError> {
    instance.precheck(actor, None)?;
    let effective = snapshot_of(instance);
    instance.authorize(actor, action, None, &effective)?;
    let transition = instance.apply(actor, action, &effective, TimeStamp::now())?;
    if let Transition::StepCompleted { next, .. } = transition {
        let approvers = match &instance.steps[next as usize].definition.approvers {
            ApproverRule::Users(ids) => ids.clone(),
            ApproverRule::Role(_) => vec![],
        };
        instance.enter_step(next, approvers, TimeStamp::now())?;
    }
    Ok(transition)
}

fn satisfied(step: &StepState) -> bool {
    let approved = step.approved_by();
    match step.definition.approval_mode {
        ApprovalMode::Any => !approved.is_empty(),
        ApprovalMode::All => !step.eligible.is_empty() && step.eligible.iter().all(|u| approved.contains(u)),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    /// Property: the current step is monotonic and always indexes a real step
    #[test]
    fn prop_current_step_never_moves_back(
        definition in definition_strategy(),
        actions in actions_strategy(),
    ) {
        let mut instance = submit(&definition);
        let mut last = instance.current_step;
        for (actor, action) in actions {
            let _ = step(&mut instance, actor, action);
            prop_assert!(instance.current_step >= last);
            prop_assert!((instance.current_step as usize) < instance.steps.len());
            last = instance.current_step;
        }
    }

    /// Property: once finished, every further action is refused and nothing changes
    #[test]
    fn prop_terminal_state_is_final(
        definition in definition_strategy(),
        actions in actions_strategy(),
    ) {
        let mut instance = submit(&definition);
        let mut frozen: Option<ApprovalInstance> = None;
        for (actor, action) in actions {
            let result = step(&mut instance, actor, action);
            if let Some(before) = &frozen {
                prop_assert!(matches!(result, Err(ApprovalError::InvalidTransition(_))));
                prop_assert_eq!(before, &instance);
            } else if instance.is_terminal() {
                prop_assert!(instance.completed_at.is_some());
                frozen = Some(instance.clone());
            }
        }
    }

    /// Property: nobody holds two decisions on one step
    #[test]
    fn prop_one_decision_per_user_per_step(
        definition in definition_strategy(),
        actions in actions_strategy(),
    ) {
        let mut instance = submit(&definition);
        for (actor, action) in actions {
            let _ = step(&mut instance, actor, action);
        }
        for state in &instance.steps {
            let mut actors: Vec<u64> = state.decisions.iter().map(|d| d.actor_id).collect();
            let total = actors.len();
            actors.sort_unstable();
            actors.dedup();
            prop_assert_eq!(actors.len(), total);
        }
    }

    /// Property: passed steps were satisfied by their mode, and approval means all were
    #[test]
    fn prop_passed_steps_were_satisfied(
        definition in definition_strategy(),
        actions in actions_strategy(),
    ) {
        let mut instance = submit(&definition);
        for (actor, action) in actions {
            let _ = step(&mut instance, actor, action);
        }
        for state in &instance.steps[..instance.current_step as usize] {
            prop_assert!(satisfied(state));
            prop_assert!(state.completed_at.is_some());
        }
        if instance.status == InstanceStatus::Approved {
            prop_assert!(instance.steps.iter().all(satisfied));
        }
        if instance.status == InstanceStatus::Rejected {
            let current = instance.current().expect("current step exists");
            prop_assert!(current.decisions.iter().any(|d| d.decision == Decision::Reject));
        }
    }

    /// Property: a comment is either refused or leaves the instance untouched
    #[test]
    fn prop_comments_do_not_change_state(
        definition in definition_strategy(),
        actions in actions_strategy(),
        commenter in prop_oneof![1u64..=7, Just(SUBMITTER)],
    ) {
        let mut instance = submit(&definition);
        for (actor, action) in actions {
            let _ = step(&mut instance, actor, action);
        }
        let before = instance.clone();
        match step(&mut instance, commenter, Action::Comment) {
            Ok(transition) => prop_assert_eq!(transition, Transition::Commented),
            Err(e) => prop_assert!(
                matches!(e, ApprovalError::PermissionDenied(_) | ApprovalError::InvalidTransition(_)),
                "unexpected error {:?}", e
            ),
        }
        prop_assert_eq!(before, instance);
    }
}
