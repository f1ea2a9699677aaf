//! Task trait - binds a task type string to a Rust argument type.

use serde::Serialize;
use serde::de::DeserializeOwned;

/// A typed task. Its serialized form is the job's `arguments` object.
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct SendEmail {
///     to: String,
///     subject: String,
/// }
///
/// impl Task for SendEmail {
///     const TYPE: &'static str = "send_email";
/// }
/// ```
///
/// # Trait Bounds
/// - `Serialize`: turned into the arguments map at submission
/// - `DeserializeOwned`: decoded back from the arguments before the handler runs
/// - `Send + Sync + 'static`: handlers are shared across dispatcher workers
pub trait Task: Serialize + DeserializeOwned + Send + Sync + 'static {
    const TYPE: &'static str;
}
