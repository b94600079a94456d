use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result as AnyResult;
use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
};
use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{error, info};
use uuid::Uuid;

use sacco_core::errors::CoreError;
use sacco_core::external::PaymentGateway;
use sacco_core::models::{
    AdminAction, ApprovalDecision, PaymentTransaction, TransactionStatus,
};
use sacco_core::storage::Store;
use sacco_engine::{
    AllocationEngine, AllocationOutcome, ConsensusActionService, StepOutcome, WorkflowEngine,
    WorkflowProgress,
};
use sacco_pgstore::{PgRoles, PgStore};
use sacco_platform::{
    AllocationSummaryResponse, CreateActionRequest, CreateActionResponse, CreateLoanRequest,
    CreateLoanResponse, DecideLoanRequest, DecideLoanResponse, InitiatePaymentRequest,
    InitiatePaymentResponse, PaymentCallbackRequest, PaymentCallbackResponse,
    PaymentStatusResponse, RedisBus, RedisNotifier, RedisStkGateway, ServiceConfig,
    VerifyActionRequest, VerifyActionResponse, connect_database,
};

/// Flat monthly rate in percent applied when the application leaves it out.
fn default_interest_rate() -> Decimal {
    Decimal::from(3)
}

#[derive(Clone)]
struct AppState {
    store: Arc<dyn Store>,
    consensus: Arc<ConsensusActionService>,
    workflow: Arc<WorkflowEngine>,
    allocation: Arc<AllocationEngine>,
    payments: Arc<dyn PaymentGateway>,
}

#[tokio::main]
async fn main() -> AnyResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "sacco_gateway=info".to_string()),
        )
        .init();

    let config = ServiceConfig::from_env("0.0.0.0:8080")?;
    let pool = connect_database(&config).await?;
    let redis = RedisBus::connect(&config.redis_url)?;
    let policy = sacco_platform::config::policy_from_env()?;

    let store: Arc<dyn Store> = Arc::new(PgStore::new(pool.clone()));
    let roles = Arc::new(PgRoles::new(pool));
    let notifier = Arc::new(RedisNotifier::new(redis.clone()));
    let payments: Arc<dyn PaymentGateway> = Arc::new(RedisStkGateway::new(redis));

    let state = AppState {
        consensus: Arc::new(ConsensusActionService::new(
            store.clone(),
            roles.clone(),
            notifier.clone(),
        )),
        workflow: Arc::new(WorkflowEngine::new(
            store.clone(),
            roles,
            notifier.clone(),
        )),
        allocation: Arc::new(AllocationEngine::new(store.clone(), notifier, policy)),
        store,
        payments,
    };

    let router = Router::new()
        .route("/healthz", get(healthz))
        .route("/actions", post(create_action))
        .route("/actions/{action_id}", get(get_action))
        .route("/actions/{action_id}/verify", post(verify_action))
        .route("/loans", post(create_loan))
        .route("/loans/{loan_id}/decide", post(decide_loan))
        .route("/loans/{loan_id}/progress", get(loan_progress))
        .route("/loans/{loan_id}/disburse", post(disburse_loan))
        .route("/payments", post(initiate_payment))
        .route("/payments/callback", post(payment_callback))
        .route("/payments/{reference}", get(payment_status))
        .route(
            "/members/{member_id}/allocation-summary",
            get(allocation_summary),
        )
        .with_state(state);

    let addr: SocketAddr = config.http_addr.parse()?;
    info!("gateway listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}

async fn healthz() -> &'static str {
    "ok"
}

async fn create_action(
    State(state): State<AppState>,
    Json(request): Json<CreateActionRequest>,
) -> Result<Json<CreateActionResponse>, (StatusCode, String)> {
    let action = state
        .consensus
        .initiate(
            request.initiated_by,
            request.entity_id,
            &request.reason,
            request.action,
        )
        .await
        .map_err(http_error)?;

    Ok(Json(CreateActionResponse {
        action_id: action.id,
        status: action.status.as_str().to_string(),
        created_at: action.created_at,
    }))
}

async fn get_action(
    Path(action_id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<Json<AdminAction>, (StatusCode, String)> {
    let action = state
        .store
        .action(action_id)
        .await
        .map_err(http_error)?
        .ok_or((StatusCode::NOT_FOUND, "action not found".to_string()))?;
    Ok(Json(action))
}

async fn verify_action(
    Path(action_id): Path<Uuid>,
    State(state): State<AppState>,
    Json(request): Json<VerifyActionRequest>,
) -> Result<Json<VerifyActionResponse>, (StatusCode, String)> {
    let decision = parse_decision(&request.decision)?;
    let outcome = state
        .consensus
        .verify(
            action_id,
            request.verifier_id,
            decision,
            request.comment.as_deref(),
        )
        .await
        .map_err(http_error)?;

    Ok(Json(VerifyActionResponse {
        action_id,
        status: outcome.status.as_str().to_string(),
        approvals: outcome.approvals,
        rejections: outcome.rejections,
    }))
}

async fn create_loan(
    State(state): State<AppState>,
    Json(request): Json<CreateLoanRequest>,
) -> Result<Json<CreateLoanResponse>, (StatusCode, String)> {
    let rate = request.interest_rate.unwrap_or_else(default_interest_rate);
    let route = state
        .workflow
        .create_loan(
            request.borrower_id,
            request.amount,
            rate,
            request.repayment_months,
        )
        .await
        .map_err(http_error)?;

    Ok(Json(CreateLoanResponse {
        loan_id: route.loan.id,
        status: route.loan.status.as_str().to_string(),
        workflow: route.workflow.name,
        current_step: route.current_step.name,
        total_steps: route.total_steps,
    }))
}

async fn decide_loan(
    Path(loan_id): Path<Uuid>,
    State(state): State<AppState>,
    Json(request): Json<DecideLoanRequest>,
) -> Result<Json<DecideLoanResponse>, (StatusCode, String)> {
    let decision = parse_decision(&request.decision)?;
    let outcome = state
        .workflow
        .decide(loan_id, request.approver_id, decision, request.comment.as_deref())
        .await
        .map_err(http_error)?;

    let response = match outcome {
        StepOutcome::Pending {
            approvals,
            required,
        } => DecideLoanResponse {
            loan_id,
            status: "pending".to_string(),
            approvals: Some(approvals),
            required: Some(required),
            next_step: None,
        },
        StepOutcome::Advanced { next_step } => DecideLoanResponse {
            loan_id,
            status: "advanced".to_string(),
            approvals: None,
            required: None,
            next_step: Some(next_step.name),
        },
        StepOutcome::Approved => DecideLoanResponse {
            loan_id,
            status: "approved".to_string(),
            approvals: None,
            required: None,
            next_step: None,
        },
        StepOutcome::Rejected => DecideLoanResponse {
            loan_id,
            status: "rejected".to_string(),
            approvals: None,
            required: None,
            next_step: None,
        },
    };
    Ok(Json(response))
}

async fn loan_progress(
    Path(loan_id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<Json<WorkflowProgress>, (StatusCode, String)> {
    let progress = state.workflow.progress(loan_id).await.map_err(http_error)?;
    Ok(Json(progress))
}

async fn disburse_loan(
    Path(loan_id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<StatusCode, (StatusCode, String)> {
    state.workflow.disburse(loan_id).await.map_err(http_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn initiate_payment(
    State(state): State<AppState>,
    Json(request): Json<InitiatePaymentRequest>,
) -> Result<Json<InitiatePaymentResponse>, (StatusCode, String)> {
    if request.amount <= Decimal::ZERO {
        return Err((
            StatusCode::BAD_REQUEST,
            "payment amount must be positive".to_string(),
        ));
    }
    if request.phone.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            "phone number is required".to_string(),
        ));
    }

    let reference = state
        .payments
        .initiate(&request.phone, request.amount, &request.member_id.to_string())
        .await
        .map_err(|err| {
            error!("payment initiation failed: {err}");
            (StatusCode::BAD_GATEWAY, "payment gateway unavailable".to_string())
        })?;

    let transaction = PaymentTransaction {
        id: Uuid::new_v4(),
        member_id: request.member_id,
        amount: request.amount,
        kind: request.kind,
        reference: reference.clone(),
        status: TransactionStatus::Pending,
        allocation: None,
        created_at: Utc::now(),
        completed_at: None,
    };
    let mut tx = state.store.begin().await.map_err(http_error)?;
    tx.insert_transaction(&transaction).await.map_err(http_error)?;
    tx.commit().await.map_err(http_error)?;

    Ok(Json(InitiatePaymentResponse {
        transaction_id: transaction.id,
        reference,
        status: transaction.status.as_str().to_string(),
    }))
}

async fn payment_callback(
    State(state): State<AppState>,
    Json(request): Json<PaymentCallbackRequest>,
) -> Result<Json<PaymentCallbackResponse>, (StatusCode, String)> {
    if !request.success {
        state
            .allocation
            .fail(&request.reference)
            .await
            .map_err(http_error)?;
        // the provider keeps redelivering anything but a 2xx
        return Ok(Json(PaymentCallbackResponse {
            reference: request.reference,
            status: "failed".to_string(),
            allocation: None,
        }));
    }

    let outcome = state
        .allocation
        .allocate(request.member_id, request.amount, &request.reference)
        .await
        .map_err(http_error)?;

    let response = match outcome {
        AllocationOutcome::Settled(breakdown) => PaymentCallbackResponse {
            reference: request.reference,
            status: "completed".to_string(),
            allocation: Some(breakdown),
        },
        AllocationOutcome::AlreadySettled => PaymentCallbackResponse {
            reference: request.reference,
            status: "already_settled".to_string(),
            allocation: None,
        },
    };
    Ok(Json(response))
}

async fn payment_status(
    Path(reference): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<PaymentStatusResponse>, (StatusCode, String)> {
    let transaction = state
        .store
        .transaction_by_reference(&reference)
        .await
        .map_err(http_error)?
        .ok_or((StatusCode::NOT_FOUND, "transaction not found".to_string()))?;

    Ok(Json(PaymentStatusResponse {
        reference: transaction.reference,
        status: transaction.status.as_str().to_string(),
        amount: transaction.amount,
        allocation: transaction.allocation,
        completed_at: transaction.completed_at,
    }))
}

async fn allocation_summary(
    Path(member_id): Path<Uuid>,
    State(state): State<AppState>,
) -> Result<Json<AllocationSummaryResponse>, (StatusCode, String)> {
    let summary = state
        .allocation
        .summary(member_id)
        .await
        .map_err(http_error)?;

    Ok(Json(AllocationSummaryResponse {
        member_id: summary.member_id,
        outstanding_loans: summary.outstanding_loans,
        active_loan_count: summary.active_loan_count,
        shares_held: summary.shares_held,
        share_value: summary.share_value,
        savings_total: summary.savings_total,
        has_minimum_shares: summary.has_minimum_shares,
    }))
}

fn parse_decision(raw: &str) -> Result<ApprovalDecision, (StatusCode, String)> {
    ApprovalDecision::parse(raw).ok_or((
        StatusCode::BAD_REQUEST,
        format!("decision must be approved or rejected, got {raw:?}"),
    ))
}

fn http_error(err: CoreError) -> (StatusCode, String) {
    let status = match &err {
        CoreError::Validation(_) => StatusCode::BAD_REQUEST,
        CoreError::Authorization(_) => StatusCode::FORBIDDEN,
        CoreError::NotFound(_) => StatusCode::NOT_FOUND,
        CoreError::Conflict(_) => StatusCode::CONFLICT,
        CoreError::System(_) | CoreError::Storage(_) => {
            error!("request failed: {err}");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, err.to_string())
}
