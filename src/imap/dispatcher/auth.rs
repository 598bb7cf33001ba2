//-
// Copyright (c) 2024, the Wingmap authors
//
// This file is part of Wingmap.
//
// Wingmap is free software: you can  redistribute it and/or modify it under
// the terms of  the GNU General Public  License as published  by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Wingmap is distributed  in the hope that  it will be useful,  but WITHOUT
// ANY WARRANTY; without  even the implied warranty of  MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for
// more details.
//
// You should have received a copy of the GNU General Public License along
// with Wingmap. If not, see <http://www.gnu.org/licenses/>.

use log::info;

use super::defs::*;

impl CommandProcessor {
    pub(super) async fn cmd_log_in(
        &mut self,
        userid: String,
        password: String,
    ) -> CmdResult {
        if self.principal.is_some() {
            return Err(bad("Already logged in"));
        }

        let principal = self
            .authenticator
            .login(&userid, &password, self.peer)
            .await
            .map_err(|e| map_error(&self.log_prefix, e))?;

        self.log_prefix.set_user(principal.username.clone());
        info!("{} Login successful", self.log_prefix);
        self.principal = Some(principal);

        Ok(Response {
            cond: Cond::Ok,
            code: Some(RespCode::Capability(self.capability_line())),
            quip: std::borrow::Cow::Borrowed("Logged in"),
        })
    }
}
