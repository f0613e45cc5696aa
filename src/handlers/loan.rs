use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::ApiResult;
use crate::loan::{
    Billing, CreateLoanRequestParams, LoanService, MakePaymentParams, PaymentReceipt,
};
use crate::models::ApiResponse;
use crate::money::Money;

/// Body of a payment; the loan comes from the path
#[derive(Debug, Deserialize)]
pub struct PaymentBody {
    pub user_id: i64,
    pub amount: String,
}

#[derive(Debug, Deserialize)]
pub struct OwnerQuery {
    pub user_id: i64,
}

#[derive(Debug, Serialize)]
pub struct LoanCreated {
    pub loan_id: i64,
}

#[derive(Debug, Serialize)]
pub struct Outstanding {
    pub loan_id: i64,
    pub outstanding: Money,
}

#[derive(Debug, Serialize)]
pub struct Delinquency {
    pub loan_id: i64,
    pub delinquent: bool,
}

pub async fn create_loan(
    State(service): State<Arc<LoanService>>,
    payload: Result<Json<CreateLoanRequestParams>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<ApiResponse<LoanCreated>>)> {
    let Json(params) = payload?;
    let loan_id = service.create_loan_request(params).await?;

    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::ok(LoanCreated { loan_id })),
    ))
}

pub async fn make_payment(
    State(service): State<Arc<LoanService>>,
    loan_id: Result<Path<i64>, PathRejection>,
    payload: Result<Json<PaymentBody>, JsonRejection>,
) -> ApiResult<Json<ApiResponse<PaymentReceipt>>> {
    let Path(loan_id) = loan_id?;
    let Json(body) = payload?;

    let receipt = service
        .make_payment(MakePaymentParams {
            user_id: body.user_id,
            loan_id,
            amount: body.amount,
        })
        .await?;

    Ok(Json(ApiResponse::ok(receipt)))
}

pub async fn get_outstanding(
    State(service): State<Arc<LoanService>>,
    loan_id: Result<Path<i64>, PathRejection>,
    owner: Result<Query<OwnerQuery>, QueryRejection>,
) -> ApiResult<Json<ApiResponse<Outstanding>>> {
    let Path(loan_id) = loan_id?;
    let Query(owner) = owner?;
    let outstanding = service.get_outstanding(owner.user_id, loan_id).await?;

    Ok(Json(ApiResponse::ok(Outstanding {
        loan_id,
        outstanding,
    })))
}

pub async fn get_delinquency(
    State(service): State<Arc<LoanService>>,
    loan_id: Result<Path<i64>, PathRejection>,
) -> ApiResult<Json<ApiResponse<Delinquency>>> {
    let Path(loan_id) = loan_id?;
    let delinquent = service.is_delinquent(loan_id).await?;

    Ok(Json(ApiResponse::ok(Delinquency {
        loan_id,
        delinquent,
    })))
}

pub async fn list_billings(
    State(service): State<Arc<LoanService>>,
    loan_id: Result<Path<i64>, PathRejection>,
    owner: Result<Query<OwnerQuery>, QueryRejection>,
) -> ApiResult<Json<ApiResponse<Vec<Billing>>>> {
    let Path(loan_id) = loan_id?;
    let Query(owner) = owner?;
    let billings = service.list_billings(owner.user_id, loan_id).await?;

    Ok(Json(ApiResponse::ok(billings)))
}
