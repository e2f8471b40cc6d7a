//! The response envelope every mutating command returns

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, minicbor::Encode, minicbor::Decode)]
pub enum ResultCode {
    #[n(0)]
    Ok,
    /// Malformed request or idempotency key reused for a different payload.
    #[n(1)]
    Invalid,
    /// Authorization, lockout, rate limit or domain-state rejection.
    #[n(2)]
    Denied,
    /// Durable store or audit failure. Retrying the identical request is safe.
    #[n(3)]
    Error,
}

impl ResultCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultCode::Ok => "OK",
            ResultCode::Invalid => "INVALID",
            ResultCode::Denied => "DENIED",
            ResultCode::Error => "ERROR",
        }
    }
}

impl std::fmt::Display for ResultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct Response<T> {
    #[n(0)]
    pub request_id: String, // echoed from the caller, empty when none was supplied
    #[n(1)]
    pub result_code: ResultCode,
    #[n(2)]
    pub denial_reason: Option<String>,
    #[n(3)]
    pub server_time: String,
    #[n(4)]
    pub payload: Option<T>,
}

impl<T> Response<T> {
    pub fn is_ok(&self) -> bool {
        self.result_code == ResultCode::Ok
    }

    /// The domain payload of a successful response.
    pub fn into_payload(self) -> Option<T> {
        match self.result_code {
            ResultCode::Ok => self.payload,
            _ => None,
        }
    }

    pub fn reason(&self) -> &str {
        self.denial_reason.as_deref().unwrap_or("")
    }
}
