//! Address and asset discovery.
//!
//! Before a connection can operate, an endpoint asks its upstream peer for
//! the address it is reachable at and the asset it settles in. The request
//! is a zero-amount Prepare to [`ILDCP_DESTINATION`]; the Fulfill data is
//!
//! ```text
//! address var | asset_scale u8 | asset_code var
//! ```

use crate::packet::{Fulfill, Packet, Prepare};
use crate::plugin::{Plugin, TransportError, TransportResult};
use paystream_crypto::{FULFILLMENT_SIZE, fulfillment_to_condition};
use std::time::{Duration, SystemTime};

/// Destination of discovery requests.
pub const ILDCP_DESTINATION: &str = "peer.config";

/// Expiry given to discovery requests.
pub const ILDCP_EXPIRY: Duration = Duration::from_secs(60);

/// Fixed fulfillment used by discovery (all zeroes).
pub const ILDCP_FULFILLMENT: [u8; FULFILLMENT_SIZE] = [0u8; FULFILLMENT_SIZE];

/// This endpoint's address and asset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressInfo {
    /// Own address
    pub address: String,
    /// Asset code, e.g. `XRP`
    pub asset_code: String,
    /// Decimal scale of amounts
    pub asset_scale: u8,
}

impl AddressInfo {
    /// Create address info.
    #[must_use]
    pub fn new(address: impl Into<String>, asset_code: impl Into<String>, asset_scale: u8) -> Self {
        Self {
            address: address.into(),
            asset_code: asset_code.into(),
            asset_scale,
        }
    }

    /// Encode as discovery response data.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(9 + self.address.len() + self.asset_code.len());
        put_var(&mut out, self.address.as_bytes());
        out.push(self.asset_scale);
        put_var(&mut out, self.asset_code.as_bytes());
        out
    }

    /// Decode discovery response data.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::InvalidResponse` on malformed input.
    pub fn decode(data: &[u8]) -> TransportResult<Self> {
        let (address, rest) = take_var(data)?;
        let (&asset_scale, rest) = rest
            .split_first()
            .ok_or_else(|| invalid("missing asset scale"))?;
        let (asset_code, rest) = take_var(rest)?;
        if !rest.is_empty() {
            return Err(invalid("trailing bytes"));
        }
        Ok(Self {
            address: address.to_string(),
            asset_code: asset_code.to_string(),
            asset_scale,
        })
    }
}

/// Discovery request.
#[must_use]
pub fn request() -> Prepare {
    Prepare {
        amount: 0,
        expires_at: SystemTime::now() + ILDCP_EXPIRY,
        execution_condition: fulfillment_to_condition(&ILDCP_FULFILLMENT),
        destination: ILDCP_DESTINATION.to_string(),
        data: Vec::new(),
    }
}

/// True if `prepare` is a discovery request.
#[must_use]
pub fn is_request(prepare: &Prepare) -> bool {
    prepare.destination == ILDCP_DESTINATION
}

/// Discovery response for `info`.
#[must_use]
pub fn response(info: &AddressInfo) -> Fulfill {
    Fulfill {
        fulfillment: ILDCP_FULFILLMENT,
        data: info.encode(),
    }
}

/// Ask the plugin's upstream for this endpoint's address and asset.
///
/// # Errors
///
/// Returns a `TransportError` if the request fails, is rejected, or the
/// response is malformed.
pub async fn fetch(plugin: &dyn Plugin) -> TransportResult<AddressInfo> {
    let response = plugin.send_data(request().to_bytes()).await?;
    match Packet::from_bytes(&response) {
        Ok(Packet::Fulfill(fulfill)) => {
            let info = AddressInfo::decode(&fulfill.data)?;
            tracing::debug!(
                address = %info.address,
                asset_code = %info.asset_code,
                asset_scale = info.asset_scale,
                "Fetched address info"
            );
            Ok(info)
        }
        Ok(Packet::Reject(reject)) => Err(invalid(format!(
            "discovery rejected: {} {}",
            reject.code, reject.message
        ))),
        Ok(Packet::Prepare(_)) => Err(invalid("unexpected prepare")),
        Err(e) => Err(invalid(e.to_string())),
    }
}

fn invalid(msg: impl Into<String>) -> TransportError {
    TransportError::InvalidResponse(msg.into())
}

#[allow(clippy::cast_possible_truncation)]
fn put_var(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    out.extend_from_slice(bytes);
}

fn take_var(data: &[u8]) -> TransportResult<(&str, &[u8])> {
    let len: [u8; 4] = data
        .get(..4)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| invalid("truncated length"))?;
    let len = u32::from_be_bytes(len) as usize;
    let body = data
        .get(4..4 + len)
        .ok_or_else(|| invalid("truncated field"))?;
    let text = std::str::from_utf8(body).map_err(|_| invalid("invalid UTF-8"))?;
    Ok((text, &data[4 + len..]))
}
