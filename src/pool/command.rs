use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use crate::binder;
use crate::connection::ConnectionHandle;
use crate::driver::{ProviderCommand, ProviderParameter};
use crate::error::DbError;
use crate::options::DbOptions;
use crate::request::CommandRequest;
use crate::transaction::TransactionHandle;

use super::{ObjectPool, PoolStats};

/// Free lists for provider commands and their parameters.
#[derive(Debug)]
pub struct CommandPool {
    commands: ObjectPool<ProviderCommand>,
    parameters: ObjectPool<ProviderParameter>,
}

impl CommandPool {
    #[must_use]
    pub fn new(command_capacity: usize, parameter_capacity: usize) -> Self {
        Self {
            commands: ObjectPool::new("commands", command_capacity),
            parameters: ObjectPool::new("parameters", parameter_capacity),
        }
    }

    #[must_use]
    pub fn from_options(options: &DbOptions) -> Self {
        Self::new(options.command_pool_capacity, options.parameter_pool_capacity)
    }

    /// Rent a command attached to `connection` with every parameter of `request` bound.
    ///
    /// The command goes back to the pool when the returned guard drops, including when
    /// binding fails part way.
    ///
    /// # Errors
    /// Returns `DbError::Validation` when a parameter cannot be bound.
    pub fn rent(
        self: &Arc<Self>,
        connection: &ConnectionHandle,
        transaction: Option<&TransactionHandle>,
        request: &CommandRequest,
        options: &DbOptions,
    ) -> Result<RentedCommand, DbError> {
        let mut rented = RentedCommand {
            command: self.commands.rent(ProviderCommand::default),
            pool: Arc::clone(self),
        };
        let command = &mut rented.command;
        command.connection_id = Some(connection.id());
        command.transaction_id = transaction.map(TransactionHandle::id);
        binder::bind(
            command,
            request,
            options,
            connection.provider(),
            &self.parameters,
        )?;
        Ok(rented)
    }

    #[must_use]
    pub fn command_stats(&self) -> PoolStats {
        self.commands.stats()
    }

    #[must_use]
    pub fn parameter_stats(&self) -> PoolStats {
        self.parameters.stats()
    }

    fn give_back(&self, mut command: ProviderCommand) {
        for mut parameter in command.parameters.drain(..) {
            parameter.reset();
            self.parameters.give_back(parameter);
        }
        command.text.clear();
        command.kind = Default::default();
        command.timeout = None;
        command.behavior = Default::default();
        command.connection_id = None;
        command.transaction_id = None;
        self.commands.give_back(command);
    }
}

/// A command on loan from a [`CommandPool`].
pub struct RentedCommand {
    command: ProviderCommand,
    pool: Arc<CommandPool>,
}

impl Deref for RentedCommand {
    type Target = ProviderCommand;

    fn deref(&self) -> &Self::Target {
        &self.command
    }
}

impl DerefMut for RentedCommand {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.command
    }
}

impl Drop for RentedCommand {
    fn drop(&mut self) {
        self.pool.give_back(std::mem::take(&mut self.command));
    }
}

impl std::fmt::Debug for RentedCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RentedCommand")
            .field("command", &self.command)
            .finish_non_exhaustive()
    }
}

