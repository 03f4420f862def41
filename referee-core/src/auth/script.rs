//! Declarative login rituals, one shape per [`PlatformKind`].

use crate::browser::Locator;
use crate::platform::{PlatformKind, PlatformSpec};

/// Credential material a step types in. Resolved at run time so scripts
/// never hold secrets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepValue {
    Identity,
    Secret,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepAction {
    Navigate { url: String },
    Fill { target: Locator, value: StepValue },
    Click { target: Locator },
}

#[derive(Debug, Clone, PartialEq)]
pub enum SuccessPredicate {
    Always,
    Present(Locator),
    TextContains(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct AuthStep {
    pub name: String,
    pub action: StepAction,
    pub expect: SuccessPredicate,
}

impl AuthStep {
    fn new(name: &str, action: StepAction, expect: SuccessPredicate) -> Self {
        Self {
            name: name.to_string(),
            action,
            expect,
        }
    }
}

/// Steps driven inside a window the portal opens itself.
#[derive(Debug, Clone, PartialEq)]
pub struct SecondaryWindowScript {
    pub trigger: Locator,
    pub steps: Vec<AuthStep>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SecondFactorScript {
    pub prompt: Locator,
    pub input: Locator,
    pub submit: Option<Locator>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoginScript {
    pub platform_id: String,
    /// Primary-context steps up to and including credential submission.
    pub steps: Vec<AuthStep>,
    pub secondary: Option<SecondaryWindowScript>,
    pub second_factor: Option<SecondFactorScript>,
    pub authenticated: Locator,
    pub rejected: Option<Locator>,
}

impl LoginScript {
    pub fn for_platform(spec: &PlatformSpec) -> Self {
        let selectors = &spec.selectors;
        let identity = Locator::parse(&selectors.identity);
        let submit = Locator::parse(&selectors.submit);
        let secret = selectors.secret.as_deref().map(Locator::parse);

        let navigate = |expect: &Locator| {
            AuthStep::new(
                "open_login",
                StepAction::Navigate {
                    url: spec.login_url.clone(),
                },
                SuccessPredicate::Present(expect.clone()),
            )
        };
        let fill = |name: &str, target: &Locator, value| {
            AuthStep::new(
                name,
                StepAction::Fill {
                    target: target.clone(),
                    value,
                },
                SuccessPredicate::Always,
            )
        };
        let click = |name: &str, target: &Locator| {
            AuthStep::new(
                name,
                StepAction::Click {
                    target: target.clone(),
                },
                SuccessPredicate::Always,
            )
        };

        let mut steps = Vec::new();
        let mut secondary = None;
        match spec.kind {
            PlatformKind::Credentials => {
                steps.push(navigate(&identity));
                steps.push(fill("fill_identity", &identity, StepValue::Identity));
                if let Some(secret) = &secret {
                    steps.push(fill("fill_secret", secret, StepValue::Secret));
                }
                steps.push(click("submit_credentials", &submit));
            }
            PlatformKind::OauthRedirect => {
                let trigger = selectors
                    .oauth_trigger
                    .as_deref()
                    .map(Locator::parse)
                    .unwrap_or_else(|| submit.clone());
                steps.push(navigate(&trigger));
                let mut window_steps = vec![fill("fill_identity", &identity, StepValue::Identity)];
                if let Some(secret) = &secret {
                    window_steps.push(fill("fill_secret", secret, StepValue::Secret));
                }
                window_steps.push(click("submit_credentials", &submit));
                if let Some(authorize) = selectors.oauth_authorize.as_deref() {
                    window_steps.push(click("confirm_authorization", &Locator::parse(authorize)));
                }
                secondary = Some(SecondaryWindowScript {
                    trigger,
                    steps: window_steps,
                });
            }
            PlatformKind::EmailCode => {
                steps.push(navigate(&identity));
                steps.push(fill("fill_identity", &identity, StepValue::Identity));
                steps.push(click("request_code", &submit));
            }
        }

        let second_factor = selectors
            .second_factor_prompt
            .as_deref()
            .map(|prompt| SecondFactorScript {
                prompt: Locator::parse(prompt),
                input: selectors
                    .second_factor_input
                    .as_deref()
                    .map(Locator::parse)
                    .unwrap_or_else(|| Locator::parse(prompt)),
                submit: selectors.second_factor_submit.as_deref().map(Locator::parse),
            });

        Self {
            platform_id: spec.id.clone(),
            steps,
            secondary,
            second_factor,
            authenticated: spec.authenticated_locator(),
            rejected: selectors.rejected.as_deref().map(Locator::parse),
        }
    }

    /// Every step name in execution order, secondary window included.
    pub fn step_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.steps.iter().map(|step| step.name.as_str()).collect();
        if let Some(secondary) = &self.secondary {
            names.push("open_secondary_window");
            names.extend(secondary.steps.iter().map(|step| step.name.as_str()));
        }
        names
    }
}
