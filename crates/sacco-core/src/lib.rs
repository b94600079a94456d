pub mod errors;
pub mod external;
pub mod models;
pub mod policy;
pub mod storage;

pub use errors::CoreError;
pub use external::{Notice, Notifier, PaymentGateway, RoleDirectory};
pub use models::{
    ActionStatus, ActionTarget, AdminAction, AdminActionKind, AdminVerification,
    AllocationBreakdown, ApprovalDecision, ApprovalHistoryEntry, ApprovalWorkflow,
    GuarantorStatus, IncomeEntry, Loan, LoanGuarantor, LoanRepayment, LoanStatus, Member,
    PaymentTransaction, SavingsDeposit, SharePurchase, TransactionStatus, VoteTally,
    WelfarePayment, WorkflowStep,
};
pub use policy::AllocationPolicy;
pub use storage::{Store, StoreTx};
