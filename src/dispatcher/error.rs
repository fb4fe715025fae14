//! Errors surfaced synchronously to command submitters

use crate::model::CommandAction;
use crate::mqtt::PublishError;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum DispatchError {
    /// The device id cannot be used as a topic level
    #[error("Invalid device id: {0:?}")]
    InvalidDevice(String),

    /// A command for the same device and action is still awaiting its acknowledgement
    #[error("Command {pending} ({action}) for device {device_id} is still pending")]
    Conflict {
        device_id: String,
        action: CommandAction,
        pending: Uuid,
    },

    /// The command was recorded as Failed because the publish failed immediately
    #[error("Command {command_id} could not be published: {source}")]
    Publish {
        command_id: Uuid,
        source: PublishError,
    },

    #[error("Command {0} not found")]
    NotFound(Uuid),
}
