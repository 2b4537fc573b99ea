//! Route handlers: thin glue from validated JSON bodies to the typed
//! managers, and from manager results back to response DTOs.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::account::manager::{CreateAccount, ListAccounts};
use crate::account::{AccountStatus, HolderType};
use crate::error::{LedgerError, Result};
use crate::http::validation::{self, validate_body};
use crate::http::{ApiResponse, Dispatcher, RequestContext, RouteId};
use crate::transaction::holds::HoldRequest;
use crate::transaction::manager::{
    CreditRequest, DebitRequest, MultiTransferDestination, MultiTransferRequest, RefundRequest,
    TransferRequest,
};

fn str_field(body: &Value, name: &str) -> String {
    body.get(name)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

fn opt_str_field(body: &Value, name: &str) -> Option<String> {
    body.get(name)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

fn i64_field(body: &Value, name: &str) -> i64 {
    body.get(name).and_then(|v| v.as_i64()).unwrap_or_default()
}

fn opt_i64_field(body: &Value, name: &str) -> Option<i64> {
    body.get(name).and_then(|v| v.as_i64())
}

fn bool_field(body: &Value, name: &str) -> bool {
    body.get(name).and_then(|v| v.as_bool()).unwrap_or(false)
}

fn obj_field(body: &Value, name: &str) -> Option<Value> {
    body.get(name).filter(|v| v.is_object()).cloned()
}

fn parse_uuid(raw: &str, what: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).map_err(|_| LedgerError::InvalidArgument(format!("invalid {what}: {raw}")))
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    raw.parse::<DateTime<Utc>>()
        .map_err(|_| LedgerError::InvalidArgument(format!("invalid timestamp: {raw}")))
}

impl Dispatcher {
    pub(crate) async fn invoke(
        &self,
        route: RouteId,
        ctx: &RequestContext,
        params: &HashMap<String, String>,
        body: Value,
        query: &HashMap<String, String>,
        _headers: &HashMap<String, String>,
    ) -> Result<ApiResponse> {
        match route {
            RouteId::Ok => Ok(ApiResponse::ok(json!({"ok": true}))),

            RouteId::Health => {
                let database = self.core().store.ping().await.is_ok();
                let schema = if database {
                    let table = self.core().store.table("migration");
                    sqlx::query_scalar::<_, i64>(&format!(
                        "SELECT {} FROM {table}",
                        crate::store::dialect::count_as_int("*")
                    ))
                    .fetch_one(self.core().store.pool())
                    .await
                    .is_ok()
                } else {
                    false
                };
                let healthy = database && schema;
                Ok(ApiResponse {
                    status: if healthy { 200 } else { 503 },
                    body: json!({
                        "status": if healthy { "healthy" } else { "unhealthy" },
                        "checks": {"database": database, "schema": schema},
                        "timestamp": Utc::now(),
                    }),
                    headers: Vec::new(),
                })
            }

            RouteId::ListAccounts => {
                let status = match query.get("status") {
                    Some(raw) => Some(AccountStatus::parse(raw).map_err(|_| {
                        LedgerError::InvalidArgument(format!("invalid status: {raw}"))
                    })?),
                    None => None,
                };
                let holder_type = match query.get("holderType") {
                    Some(raw) => Some(HolderType::parse(raw)?),
                    None => None,
                };
                let parse_num = |key: &str| -> Result<Option<i64>> {
                    match query.get(key) {
                        Some(raw) => raw
                            .parse::<i64>()
                            .map(Some)
                            .map_err(|_| LedgerError::InvalidArgument(format!("invalid {key}"))),
                        None => Ok(None),
                    }
                };
                let page = self
                    .core()
                    .accounts
                    .list(ListAccounts {
                        ledger_id: ctx.ledger_id,
                        page: parse_num("page")?,
                        per_page: parse_num("perPage")?,
                        status,
                        holder_type,
                        search: query.get("search").cloned(),
                        cursor: query.get("cursor").cloned(),
                        limit: parse_num("limit")?,
                    })
                    .await?;
                Ok(ApiResponse::ok(serde_json::to_value(page)?))
            }

            RouteId::CreateAccount => {
                validate_body(validation::CREATE_ACCOUNT, &body)?;
                let account = self
                    .core()
                    .accounts
                    .create_account(CreateAccount {
                        ledger_id: ctx.ledger_id,
                        holder_id: str_field(&body, "holderId"),
                        holder_type: HolderType::parse(&str_field(&body, "holderType"))?,
                        currency: opt_str_field(&body, "currency"),
                        allow_overdraft: bool_field(&body, "allowOverdraft"),
                        overdraft_limit: i64_field(&body, "overdraftLimit"),
                        metadata: obj_field(&body, "metadata"),
                    })
                    .await?;
                Ok(ApiResponse::created(serde_json::to_value(account)?))
            }

            RouteId::GetAccount => {
                let account = self
                    .core()
                    .accounts
                    .get_account(ctx.ledger_id, &params["holderId"])
                    .await?;
                Ok(ApiResponse::ok(serde_json::to_value(account)?))
            }

            RouteId::GetBalance => {
                let as_of = match query.get("asOf") {
                    Some(raw) => Some(parse_timestamp(raw)?),
                    None => None,
                };
                let balance = self
                    .core()
                    .accounts
                    .get_balance(ctx.ledger_id, &params["holderId"], as_of)
                    .await?;
                Ok(ApiResponse::ok(serde_json::to_value(balance)?))
            }

            RouteId::GetAccountEntries => {
                let limit = query
                    .get("limit")
                    .and_then(|raw| raw.parse::<i64>().ok())
                    .unwrap_or(50);
                let entries = self
                    .core()
                    .transactions
                    .list_account_entries(ctx.ledger_id, &params["holderId"], limit)
                    .await?;
                Ok(ApiResponse::ok(json!({"entries": entries})))
            }

            RouteId::FreezeAccount => {
                validate_body(validation::FREEZE, &body)?;
                let account = self
                    .core()
                    .accounts
                    .freeze(
                        ctx.ledger_id,
                        &params["holderId"],
                        &str_field(&body, "reason"),
                        &str_field(&body, "frozenBy"),
                    )
                    .await?;
                Ok(ApiResponse::ok(serde_json::to_value(account)?))
            }

            RouteId::UnfreezeAccount => {
                validate_body(validation::UNFREEZE, &body)?;
                let account = self
                    .core()
                    .accounts
                    .unfreeze(
                        ctx.ledger_id,
                        &params["holderId"],
                        &str_field(&body, "unfrozenBy"),
                        opt_str_field(&body, "reason").as_deref(),
                    )
                    .await?;
                Ok(ApiResponse::ok(serde_json::to_value(account)?))
            }

            RouteId::CloseAccount => {
                validate_body(validation::CLOSE, &body)?;
                let account = self
                    .core()
                    .accounts
                    .close(
                        ctx.ledger_id,
                        &params["holderId"],
                        &str_field(&body, "closedBy"),
                        opt_str_field(&body, "reason").as_deref(),
                        opt_str_field(&body, "transferToHolderId").as_deref(),
                    )
                    .await?;
                Ok(ApiResponse::ok(serde_json::to_value(account)?))
            }

            RouteId::Credit => {
                validate_body(validation::CREDIT, &body)?;
                let dto = self
                    .core()
                    .transactions
                    .credit(CreditRequest {
                        ledger_id: ctx.ledger_id,
                        holder_id: str_field(&body, "holderId"),
                        amount: i64_field(&body, "amount"),
                        reference: str_field(&body, "reference"),
                        description: opt_str_field(&body, "description"),
                        source_system_account: opt_str_field(&body, "sourceSystemAccount"),
                        idempotency_key: opt_str_field(&body, "idempotencyKey"),
                        metadata: obj_field(&body, "metadata"),
                    })
                    .await?;
                Ok(ApiResponse::created(serde_json::to_value(dto)?))
            }

            RouteId::Debit => {
                validate_body(validation::DEBIT, &body)?;
                let dto = self
                    .core()
                    .transactions
                    .debit(DebitRequest {
                        ledger_id: ctx.ledger_id,
                        holder_id: str_field(&body, "holderId"),
                        amount: i64_field(&body, "amount"),
                        reference: str_field(&body, "reference"),
                        description: opt_str_field(&body, "description"),
                        destination_system_account: opt_str_field(&body, "destinationSystemAccount"),
                        allow_overdraft: bool_field(&body, "allowOverdraft"),
                        idempotency_key: opt_str_field(&body, "idempotencyKey"),
                        metadata: obj_field(&body, "metadata"),
                    })
                    .await?;
                Ok(ApiResponse::created(serde_json::to_value(dto)?))
            }

            RouteId::Transfer => {
                validate_body(validation::TRANSFER, &body)?;
                let dto = self
                    .core()
                    .transactions
                    .transfer(TransferRequest {
                        ledger_id: ctx.ledger_id,
                        source_holder_id: str_field(&body, "sourceHolderId"),
                        destination_holder_id: str_field(&body, "destinationHolderId"),
                        amount: i64_field(&body, "amount"),
                        reference: str_field(&body, "reference"),
                        description: opt_str_field(&body, "description"),
                        exchange_rate: body.get("exchangeRate").and_then(|v| v.as_f64()),
                        idempotency_key: opt_str_field(&body, "idempotencyKey"),
                        metadata: obj_field(&body, "metadata"),
                    })
                    .await?;
                Ok(ApiResponse::created(serde_json::to_value(dto)?))
            }

            RouteId::MultiTransfer => {
                validate_body(validation::MULTI_TRANSFER, &body)?;
                let raw_destinations = body
                    .get("destinations")
                    .and_then(|v| v.as_array())
                    .cloned()
                    .unwrap_or_default();
                let mut destinations = Vec::with_capacity(raw_destinations.len());
                for dest in &raw_destinations {
                    let holder_id = dest.get("holderId").and_then(|v| v.as_str());
                    let amount = dest.get("amount").and_then(|v| v.as_i64());
                    match (holder_id, amount) {
                        (Some(holder_id), Some(amount)) if amount > 0 => {
                            destinations.push(MultiTransferDestination {
                                holder_id: holder_id.to_string(),
                                amount,
                            })
                        }
                        _ => {
                            return Err(LedgerError::InvalidArgument(
                                "each destination needs holderId and a positive amount".to_string(),
                            ))
                        }
                    }
                }
                if let Some(declared) = opt_i64_field(&body, "amount") {
                    let total: i64 = destinations.iter().map(|d| d.amount).sum();
                    if declared != total {
                        return Err(LedgerError::InvalidArgument(format!(
                            "declared amount {declared} does not match destination total {total}"
                        )));
                    }
                }
                let dto = self
                    .core()
                    .transactions
                    .multi_transfer(MultiTransferRequest {
                        ledger_id: ctx.ledger_id,
                        source_holder_id: str_field(&body, "sourceHolderId"),
                        destinations,
                        reference: str_field(&body, "reference"),
                        description: opt_str_field(&body, "description"),
                        idempotency_key: opt_str_field(&body, "idempotencyKey"),
                        metadata: None,
                    })
                    .await?;
                Ok(ApiResponse::created(serde_json::to_value(dto)?))
            }

            RouteId::Refund => {
                validate_body(validation::REFUND, &body)?;
                let dto = self
                    .core()
                    .transactions
                    .refund(RefundRequest {
                        ledger_id: ctx.ledger_id,
                        transaction_id: parse_uuid(
                            &str_field(&body, "transactionId"),
                            "transactionId",
                        )?,
                        reason: str_field(&body, "reason"),
                        amount: opt_i64_field(&body, "amount"),
                        idempotency_key: opt_str_field(&body, "idempotencyKey"),
                    })
                    .await?;
                Ok(ApiResponse::created(serde_json::to_value(dto)?))
            }

            RouteId::ListTransactions => {
                let limit = query
                    .get("limit")
                    .and_then(|raw| raw.parse::<i64>().ok())
                    .unwrap_or(50);
                let offset = query
                    .get("offset")
                    .and_then(|raw| raw.parse::<i64>().ok())
                    .unwrap_or(0);
                let transactions = self
                    .core()
                    .transactions
                    .list(ctx.ledger_id, limit, offset)
                    .await?;
                Ok(ApiResponse::ok(json!({"transactions": transactions})))
            }

            RouteId::GetTransaction => {
                let id = parse_uuid(&params["id"], "transaction id")?;
                let view = self.core().transactions.get(ctx.ledger_id, id).await?;
                Ok(ApiResponse::ok(serde_json::to_value(view)?))
            }

            RouteId::ListActiveHolds => {
                let limit = query
                    .get("limit")
                    .and_then(|raw| raw.parse::<i64>().ok())
                    .unwrap_or(50);
                let holds = self
                    .core()
                    .transactions
                    .list_active_holds(ctx.ledger_id, limit)
                    .await?;
                Ok(ApiResponse::ok(json!({"holds": holds})))
            }

            RouteId::CreateHold => {
                validate_body(validation::HOLD, &body)?;
                let dto = self
                    .core()
                    .transactions
                    .hold(HoldRequest {
                        ledger_id: ctx.ledger_id,
                        holder_id: str_field(&body, "holderId"),
                        amount: i64_field(&body, "amount"),
                        reference: str_field(&body, "reference"),
                        destination_holder_id: opt_str_field(&body, "destinationHolderId"),
                        expires_in_minutes: opt_i64_field(&body, "expiresInMinutes"),
                        idempotency_key: opt_str_field(&body, "idempotencyKey"),
                        metadata: obj_field(&body, "metadata"),
                    })
                    .await?;
                Ok(ApiResponse::created(serde_json::to_value(dto)?))
            }

            RouteId::CommitHold => {
                validate_body(validation::HOLD_COMMIT, &body)?;
                let hold_id = parse_uuid(&params["holdId"], "hold id")?;
                let dto = self
                    .core()
                    .transactions
                    .commit_hold(ctx.ledger_id, hold_id, opt_i64_field(&body, "amount"))
                    .await?;
                Ok(ApiResponse::ok(serde_json::to_value(dto)?))
            }

            RouteId::VoidHold => {
                validate_body(validation::HOLD_VOID, &body)?;
                let hold_id = parse_uuid(&params["holdId"], "hold id")?;
                let dto = self
                    .core()
                    .transactions
                    .void_hold(ctx.ledger_id, hold_id, opt_str_field(&body, "reason"))
                    .await?;
                Ok(ApiResponse::ok(serde_json::to_value(dto)?))
            }

            RouteId::ListEvents => {
                let events = self
                    .core()
                    .events
                    .list_events(&params["aggregateType"], &params["aggregateId"])
                    .await?;
                Ok(ApiResponse::ok(json!({"events": events})))
            }

            RouteId::VerifyEvents => {
                validate_body(validation::VERIFY_EVENTS, &body)?;
                let verification = self
                    .core()
                    .events
                    .verify_hash_chain(
                        &str_field(&body, "aggregateType"),
                        &str_field(&body, "aggregateId"),
                    )
                    .await?;
                Ok(ApiResponse::ok(serde_json::to_value(verification)?))
            }

            RouteId::VerifyBlocks => {
                let since = match query.get("since") {
                    Some(raw) => parse_timestamp(raw)?,
                    None => Utc::now() - chrono::Duration::days(30),
                };
                let verification = self.core().blocks.verify_recent_blocks(since).await?;
                Ok(ApiResponse::ok(serde_json::to_value(verification)?))
            }

            RouteId::OutboxStats => {
                let stats = self.core().outbox.stats().await?;
                Ok(ApiResponse::ok(serde_json::to_value(stats)?))
            }

            RouteId::AdminReconcile => {
                let run_type = body
                    .get("runType")
                    .and_then(|v| v.as_str())
                    .unwrap_or("daily");
                let report = match run_type {
                    "fast" => self.core().recon.run_fast().await?,
                    "daily" => self.core().recon.run_daily().await?,
                    other => {
                        return Err(LedgerError::InvalidArgument(format!(
                            "unknown runType: {other}"
                        )))
                    }
                };
                Ok(ApiResponse::ok(serde_json::to_value(report)?))
            }

            RouteId::AdminSealBlock => {
                let block = self.core().blocks.create_block_checkpoint().await?;
                match block {
                    Some(block) => Ok(ApiResponse::created(serde_json::to_value(block)?)),
                    None => Ok(ApiResponse::ok(json!({"sealed": false, "reason": "no new events"}))),
                }
            }
        }
    }
}
