use crate::error::Result;
use crate::handler::ConfigurationContext;
use crate::manager::StageManager;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use tracing::{debug, info};

type Trigger<S> = Arc<dyn Fn(&S) + Send + Sync>;

enum StateAction<S> {
    Stage(String),
    Trigger(Trigger<S>),
}

impl<S> Clone for StateAction<S> {
    fn clone(&self) -> Self {
        match self {
            StateAction::Stage(name) => StateAction::Stage(name.clone()),
            StateAction::Trigger(f) => StateAction::Trigger(Arc::clone(f)),
        }
    }
}

/// Starts and destroys stages as the server moves between states.
///
/// Each state owns an ordered list of stages and triggers. Entering a state
/// starts (and unpauses) its stages and runs its triggers in the order they
/// were registered. Stages shared by the old and new state keep running
/// untouched.
pub struct StageController<S> {
    manager: StageManager,
    context: ConfigurationContext,
    states: Mutex<HashMap<S, Vec<StateAction<S>>>>,
}

impl<S> StageController<S>
where
    S: Eq + Hash + Clone + Debug + Send + Sync + 'static,
{
    pub fn new(context: ConfigurationContext) -> Self {
        Self {
            manager: context.manager().clone(),
            context,
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn add_stage_to_state(&self, state: S, stage: impl Into<String>) {
        self.states
            .lock()
            .entry(state)
            .or_default()
            .push(StateAction::Stage(stage.into()));
    }

    /// Run `trigger` every time `state` is entered
    pub fn add_trigger_to_state<F>(&self, state: S, trigger: F)
    where
        F: Fn(&S) + Send + Sync + 'static,
    {
        self.states
            .lock()
            .entry(state)
            .or_default()
            .push(StateAction::Trigger(Arc::new(trigger)));
    }

    /// Stage names registered for `state`, in registration order
    pub fn stages_for(&self, state: &S) -> Vec<String> {
        self.actions(state)
            .into_iter()
            .filter_map(|action| match action {
                StateAction::Stage(name) => Some(name),
                StateAction::Trigger(_) => None,
            })
            .collect()
    }

    pub fn transition(&self, old: &S, new: &S) -> Result<()> {
        info!(from = ?old, to = ?new, "Stage transition");
        let leaving: HashSet<String> = self.stages_for(old).into_iter().collect();
        let entering = self.actions(new);
        let staying: HashSet<&str> = entering
            .iter()
            .filter_map(|action| match action {
                StateAction::Stage(name) => Some(name.as_str()),
                StateAction::Trigger(_) => None,
            })
            .collect();

        for name in self.stages_for(old) {
            if !staying.contains(name.as_str()) {
                debug!(stage = %name, "Destroying stage on state exit");
                self.manager.managed(&name)?.destroy()?;
            }
        }

        for action in &entering {
            match action {
                StateAction::Stage(name) if leaving.contains(name) => {
                    debug!(stage = %name, "Stage kept across transition");
                }
                StateAction::Stage(name) => {
                    let stage = self.manager.managed(name)?;
                    if stage.is_running() {
                        debug!(stage = %name, "Stage already running");
                    } else {
                        stage.start(&self.context)?;
                    }
                    stage.unpause();
                }
                StateAction::Trigger(trigger) => trigger(new),
            }
        }
        Ok(())
    }

    fn actions(&self, state: &S) -> Vec<StateAction<S>> {
        self.states.lock().get(state).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DispatchConfig, StageOverrides};
    use crate::error::HandlerError;
    use crate::handler::FnHandler;
    use crate::sink::Sink;
    use crate::stage::Stage;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum ServerState {
        Starting,
        Passive,
        Active,
    }

    fn noop() -> FnHandler<impl Fn(u32) -> std::result::Result<(), HandlerError>> {
        FnHandler::new(|_: u32| Ok(()))
    }

    fn setup() -> (StageManager, Stage<u32>, Stage<u32>, Stage<u32>) {
        let config = DispatchConfig::default().with_stage_overrides(
            "active-only",
            StageOverrides {
                paused: true,
                ..StageOverrides::default()
            },
        );
        let manager = StageManager::new(config);
        let shared = manager.create_stage("shared", noop(), 1, 8).unwrap();
        let passive = manager.create_stage("passive-only", noop(), 1, 8).unwrap();
        let active = manager.create_stage("active-only", noop(), 1, 8).unwrap();
        manager
            .start_all(
                &manager.context(),
                &[],
                &["shared", "passive-only", "active-only"],
            )
            .unwrap();
        (manager, shared, passive, active)
    }

    #[test]
    fn test_transition_starts_and_destroys() {
        let (manager, shared, passive, active) = setup();
        let controller = StageController::new(manager.context());
        controller.add_stage_to_state(ServerState::Passive, "shared");
        controller.add_stage_to_state(ServerState::Passive, "passive-only");
        controller.add_stage_to_state(ServerState::Active, "shared");
        controller.add_stage_to_state(ServerState::Active, "active-only");

        controller
            .transition(&ServerState::Starting, &ServerState::Passive)
            .unwrap();
        assert!(shared.is_running());
        assert!(passive.is_running());
        assert!(!active.is_running());

        shared.add_single_threaded(1).unwrap();
        controller
            .transition(&ServerState::Passive, &ServerState::Active)
            .unwrap();
        assert!(shared.is_running());
        assert!(!passive.is_running());
        assert!(active.is_running());
        assert!(!active.is_paused());
        assert!(passive.add_single_threaded(1).is_err());

        manager.stop_all().unwrap();
    }

    #[test]
    fn test_stage_can_restart_after_destroy() {
        let (manager, _shared, passive, _active) = setup();
        let controller = StageController::new(manager.context());
        controller.add_stage_to_state(ServerState::Passive, "passive-only");

        controller
            .transition(&ServerState::Starting, &ServerState::Passive)
            .unwrap();
        controller
            .transition(&ServerState::Passive, &ServerState::Active)
            .unwrap();
        assert!(!passive.is_running());
        controller
            .transition(&ServerState::Active, &ServerState::Passive)
            .unwrap();
        assert!(passive.is_running());
        passive.add_single_threaded(5).unwrap();

        manager.stop_all().unwrap();
    }

    #[test]
    fn test_triggers_run_in_registration_order() {
        let (manager, _shared, passive, _active) = setup();
        let controller = StageController::new(manager.context());
        let log = Arc::new(Mutex::new(Vec::new()));

        let before = log.clone();
        controller.add_trigger_to_state(ServerState::Passive, move |state| {
            before.lock().push(format!("before {:?}", state));
        });
        controller.add_stage_to_state(ServerState::Passive, "passive-only");
        let after = log.clone();
        let stage = passive.clone();
        controller.add_trigger_to_state(ServerState::Passive, move |_| {
            after.lock().push(format!("after running={}", stage.is_running()));
        });

        controller
            .transition(&ServerState::Starting, &ServerState::Passive)
            .unwrap();
        assert_eq!(
            *log.lock(),
            vec!["before Passive".to_string(), "after running=true".to_string()]
        );
        manager.stop_all().unwrap();
    }

    #[test]
    fn test_unknown_stage_fails_transition() {
        let (manager, ..) = setup();
        let controller = StageController::new(manager.context());
        controller.add_stage_to_state(ServerState::Active, "missing");
        assert!(controller
            .transition(&ServerState::Passive, &ServerState::Active)
            .is_err());
        manager.stop_all().unwrap();
    }
}
