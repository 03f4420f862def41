mod machine;
mod script;
mod second_factor;
mod state;

pub use machine::{AuthOutcome, AuthSettings, AuthStateMachine};
pub use script::{
    AuthStep, LoginScript, SecondFactorScript, SecondaryWindowScript, StepAction, StepValue,
    SuccessPredicate,
};
pub use second_factor::{
    FallbackSecondFactor, HttpMailbox, MailMessage, Mailbox, MailboxSecondFactor,
    ManualSecondFactor, SecondFactorError, SecondFactorProvider, SecondFactorResult,
};
pub use state::{AuthAttempt, AuthState, IllegalTransition, StepOutcome, StepRecord};
