//! Trade-op payloads
//!
//! A single item goes out under the single-item op; several go out as one
//! batch op. Batches are capped at [`MAX_BATCH_OPS`].

use serde::Serialize;
use serde_json::Value;

use crate::error::ClientError;

/// Largest batch the server accepts in one trade op.
pub const MAX_BATCH_OPS: usize = 20;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaceOrder {
    pub inst_id: String,
    /// `cash`, `cross` or `isolated`
    pub td_mode: String,
    /// `buy` or `sell`
    pub side: String,
    /// `market`, `limit`, `post_only`, `fok`, `ioc`
    pub ord_type: String,
    pub sz: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub px: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cl_ord_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ccy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pos_side: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reduce_only: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tgt_ccy: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelOrder {
    pub inst_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ord_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cl_ord_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AmendOrder {
    pub inst_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ord_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cl_ord_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub req_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_sz: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_px: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cxl_on_fail: Option<bool>,
}

/// A trade-op payload and the ops it travels under.
pub trait TradeOp: Serialize {
    const SINGLE_OP: &'static str;
    const BATCH_OP: &'static str;

    fn validate(&self) -> Result<(), ClientError>;
}

fn require(field: &str, value: &str) -> Result<(), ClientError> {
    if value.is_empty() {
        return Err(ClientError::InvalidArgument(format!("{} is required", field)));
    }
    Ok(())
}

fn require_order_ref(ord_id: &Option<String>, cl_ord_id: &Option<String>) -> Result<(), ClientError> {
    let has = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.is_empty());
    if !has(ord_id) && !has(cl_ord_id) {
        return Err(ClientError::InvalidArgument(
            "either ordId or clOrdId is required".to_string(),
        ));
    }
    Ok(())
}

impl TradeOp for PlaceOrder {
    const SINGLE_OP: &'static str = "order";
    const BATCH_OP: &'static str = "batch-orders";

    fn validate(&self) -> Result<(), ClientError> {
        require("instId", &self.inst_id)?;
        require("tdMode", &self.td_mode)?;
        require("side", &self.side)?;
        require("ordType", &self.ord_type)?;
        require("sz", &self.sz)
    }
}

impl TradeOp for CancelOrder {
    const SINGLE_OP: &'static str = "cancel-order";
    const BATCH_OP: &'static str = "batch-cancel-orders";

    fn validate(&self) -> Result<(), ClientError> {
        require("instId", &self.inst_id)?;
        require_order_ref(&self.ord_id, &self.cl_ord_id)
    }
}

impl TradeOp for AmendOrder {
    const SINGLE_OP: &'static str = "amend-order";
    const BATCH_OP: &'static str = "batch-amend-orders";

    fn validate(&self) -> Result<(), ClientError> {
        require("instId", &self.inst_id)?;
        require_order_ref(&self.ord_id, &self.cl_ord_id)?;
        if self.new_sz.is_none() && self.new_px.is_none() {
            return Err(ClientError::InvalidArgument(
                "amend needs newSz or newPx".to_string(),
            ));
        }
        Ok(())
    }
}

/// Validate a batch and pick its op name and serialized args.
pub fn prepare<T: TradeOp>(items: &[T]) -> Result<(&'static str, Vec<Value>), ClientError> {
    if items.is_empty() {
        return Err(ClientError::InvalidArgument("empty trade batch".to_string()));
    }
    if items.len() > MAX_BATCH_OPS {
        return Err(ClientError::InvalidArgument(format!(
            "trade batch of {} exceeds the limit of {}",
            items.len(),
            MAX_BATCH_OPS
        )));
    }
    for item in items {
        item.validate()?;
    }
    let op = if items.len() == 1 {
        T::SINGLE_OP
    } else {
        T::BATCH_OP
    };
    let args = items
        .iter()
        .map(serde_json::to_value)
        .collect::<Result<Vec<_>, _>>()?;
    Ok((op, args))
}
