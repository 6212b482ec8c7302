//! Typed decode of the CDP events the session layer reacts to.

use serde::Deserialize;
use serde_json::Value;

/// Events surfaced by a [`super::CdpClient`].
///
/// The six methods the session layer drives on are decoded into typed
/// params; anything else passes through as [`CdpEvent::Other`].
#[derive(Debug, Clone)]
pub enum CdpEvent {
    Paused(PausedParams),
    Resumed,
    ScriptParsed(ScriptParsedParams),
    BreakpointResolved(BreakpointResolvedParams),
    ConsoleApiCalled(ConsoleApiParams),
    ExceptionThrown(ExceptionThrownParams),
    /// The inspector socket is gone.
    Disconnected,
    Other { method: String },
}

impl CdpEvent {
    /// Decode one wire event. A malformed payload for a known method falls
    /// back to `Other` rather than dropping the event.
    pub fn from_wire(method: &str, params: Value) -> Self {
        fn parse<T: for<'de> Deserialize<'de>>(params: Value) -> Option<T> {
            serde_json::from_value(params).ok()
        }

        match method {
            "Debugger.paused" => parse(params)
                .map(CdpEvent::Paused)
                .unwrap_or(CdpEvent::Other { method: method.to_string() }),
            "Debugger.resumed" => CdpEvent::Resumed,
            "Debugger.scriptParsed" => parse(params)
                .map(CdpEvent::ScriptParsed)
                .unwrap_or(CdpEvent::Other { method: method.to_string() }),
            "Debugger.breakpointResolved" => parse(params)
                .map(CdpEvent::BreakpointResolved)
                .unwrap_or(CdpEvent::Other { method: method.to_string() }),
            "Runtime.consoleAPICalled" => parse(params)
                .map(CdpEvent::ConsoleApiCalled)
                .unwrap_or(CdpEvent::Other { method: method.to_string() }),
            "Runtime.exceptionThrown" => parse(params)
                .map(CdpEvent::ExceptionThrown)
                .unwrap_or(CdpEvent::Other { method: method.to_string() }),
            other => CdpEvent::Other { method: other.to_string() },
        }
    }
}

/// A source location on the wire; 0-based.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct WireLocation {
    #[serde(default)]
    pub script_id: String,
    pub line_number: u32,
    #[serde(default)]
    pub column_number: u32,
}

/// One frame of the paused call stack.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallFrame {
    pub call_frame_id: String,
    #[serde(default)]
    pub function_name: String,
    pub location: WireLocation,
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PausedParams {
    pub call_frames: Vec<CallFrame>,
    pub reason: String,
    #[serde(default)]
    pub hit_breakpoints: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptParsedParams {
    pub script_id: String,
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakpointResolvedParams {
    pub breakpoint_id: String,
    pub location: WireLocation,
}

/// A value as CDP describes it; only the human-readable parts matter here.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RemoteObject {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default)]
    pub description: Option<String>,
}

impl RemoteObject {
    /// Best-effort display form for console rendering.
    pub fn display(&self) -> String {
        if let Some(value) = &self.value {
            match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            }
        } else if let Some(description) = &self.description {
            description.clone()
        } else {
            self.kind.clone()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsoleApiParams {
    #[serde(rename = "type")]
    pub level: String,
    #[serde(default)]
    pub args: Vec<RemoteObject>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExceptionThrownParams {
    pub exception_details: ExceptionDetails,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExceptionDetails {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub exception: Option<RemoteObject>,
    #[serde(default)]
    pub line_number: u32,
}
