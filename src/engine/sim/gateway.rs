// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{collections::VecDeque, sync::Mutex, time::Duration};

use async_trait::async_trait;

use crate::{
    engine::{
        cmd::{CommandGateway, CommandOutput},
        context::Context,
        sim::locked,
    },
    guard::GuardResult,
};

/// One recorded invocation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GatewayCall {
    pub program: String,
    pub args: Vec<String>,
    pub stdin: Option<Vec<u8>>,
}

/// A gateway that answers with queued responses in order and records every
/// call. Once the queue is empty every command succeeds with no output.
#[derive(Debug, Default)]
pub struct ScriptedGateway {
    responses: Mutex<VecDeque<GuardResult<CommandOutput>>>,
    calls: Mutex<Vec<GatewayCall>>,
}

impl ScriptedGateway {
    pub fn push_response(&self, response: GuardResult<CommandOutput>) {
        locked(&self.responses).push_back(response);
    }

    pub fn calls(&self) -> Vec<GatewayCall> {
        locked(&self.calls).clone()
    }
}

#[async_trait]
impl CommandGateway for ScriptedGateway {
    async fn execute(
        &self,
        ctx: &Context,
        _timeout: Duration,
        program: &str,
        args: &[String],
        stdin: Option<&[u8]>,
    ) -> GuardResult<CommandOutput> {
        ctx.check()?;
        locked(&self.calls).push(GatewayCall {
            program: program.to_string(),
            args: args.to_vec(),
            stdin: stdin.map(|s| s.to_vec()),
        });
        locked(&self.responses)
            .pop_front()
            .unwrap_or_else(|| Ok(CommandOutput::default()))
    }
}
