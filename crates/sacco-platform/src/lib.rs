pub mod config;
pub mod contracts;
pub mod db;
pub mod redis_bus;

pub use config::ServiceConfig;
pub use contracts::{
    AllocationSummaryResponse, CreateActionRequest, CreateActionResponse, CreateLoanRequest,
    CreateLoanResponse, DecideLoanRequest, DecideLoanResponse, InitiatePaymentRequest,
    InitiatePaymentResponse, PaymentCallbackRequest, PaymentCallbackResponse,
    PaymentStatusResponse, StkPushCommand, VerifyActionRequest, VerifyActionResponse,
};
pub use db::connect_database;
pub use redis_bus::{RedisBus, RedisNotifier, RedisStkGateway};
