use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Whether a workflow's trigger is live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    /// Trigger installed when one is set.
    #[default]
    Active,
    /// Runs only on demand.
    Inactive,
}

/// How the agent set of a workflow is dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// All agent steps at once.
    Parallel,
    /// One agent step at a time.
    #[default]
    Sequential,
}

/// What a step runs against: a specific agent or any holder of a capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepTarget {
    /// A specific registered agent.
    Agent { agent_id: String },
    /// Whichever agent or provider serves the capability.
    Capability { capability: String },
}

impl std::fmt::Display for StepTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepTarget::Agent { agent_id } => write!(f, "agent:{agent_id}"),
            StepTarget::Capability { capability } => write!(f, "capability:{capability}"),
        }
    }
}

/// A single unit of work inside a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Step name used in logs and errors.
    pub name: String,
    /// Where the step is dispatched.
    pub target: StepTarget,
    /// Opaque input handed to the agent or provider.
    #[serde(default)]
    pub input: serde_json::Value,
}

impl Step {
    /// A step bound to a specific agent.
    pub fn agent(name: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target: StepTarget::Agent {
                agent_id: agent_id.into(),
            },
            input: serde_json::Value::Null,
        }
    }

    /// A step resolved at run time to whichever agent or provider offers `capability`.
    pub fn capability(name: impl Into<String>, capability: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target: StepTarget::Capability {
                capability: capability.into(),
            },
            input: serde_json::Value::Null,
        }
    }

    /// Set the input passed to the target.
    pub fn with_input(mut self, input: serde_json::Value) -> Self {
        self.input = input;
        self
    }
}

/// The agent references of a workflow and how they are dispatched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentSet {
    /// How the steps are run.
    #[serde(default)]
    pub mode: ExecutionMode,
    /// Agent steps in declared order.
    #[serde(default)]
    pub steps: Vec<Step>,
}

/// A named, versioned workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    /// Workflow id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Bumped on every update.
    #[serde(default = "default_version")]
    pub version: u32,
    /// Steps run in order before the agent set.
    #[serde(default)]
    pub preprocessing: Vec<Step>,
    /// The main agent steps.
    #[serde(default)]
    pub agents: AgentSet,
    /// Steps run in order after the agent set.
    #[serde(default)]
    pub postprocessing: Vec<Step>,
    /// Five-field cron expression, evaluated in UTC.
    #[serde(default)]
    pub trigger: Option<String>,
    /// Whether the trigger is active.
    #[serde(default)]
    pub status: WorkflowStatus,
    /// First registration time.
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    /// Last update time.
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_version() -> u32 {
    1
}

impl Workflow {
    /// Create an active, empty workflow with no trigger.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            version: default_version(),
            preprocessing: Vec::new(),
            agents: AgentSet::default(),
            postprocessing: Vec::new(),
            trigger: None,
            status: WorkflowStatus::Active,
            created_at: now,
            updated_at: now,
        }
    }

    /// Set the preprocessing steps.
    pub fn with_preprocessing(mut self, steps: Vec<Step>) -> Self {
        self.preprocessing = steps;
        self
    }

    /// Set the agent set.
    pub fn with_agents(mut self, mode: ExecutionMode, steps: Vec<Step>) -> Self {
        self.agents = AgentSet { mode, steps };
        self
    }

    /// Set the postprocessing steps.
    pub fn with_postprocessing(mut self, steps: Vec<Step>) -> Self {
        self.postprocessing = steps;
        self
    }

    /// Set the recurring trigger expression.
    pub fn with_trigger(mut self, expression: impl Into<String>) -> Self {
        self.trigger = Some(expression.into());
        self
    }

    /// Set the status.
    pub fn with_status(mut self, status: WorkflowStatus) -> Self {
        self.status = status;
        self
    }

    /// True when the workflow should hold a live recurring trigger.
    pub fn is_schedulable(&self) -> bool {
        self.status == WorkflowStatus::Active
            && self.trigger.as_deref().is_some_and(|t| !t.trim().is_empty())
    }

    /// Total number of steps across all phases.
    pub fn step_count(&self) -> usize {
        self.preprocessing.len() + self.agents.steps.len() + self.postprocessing.len()
    }
}
