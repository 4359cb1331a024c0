//! Commands served on `<db>.$cmd`

use crate::session::Session;
use crate::store::CappedSpec;
use docwire_core::{Bson, BsonType, DocWireResult, RawDoc};
use tracing::{debug, info};

fn failure(message: &str, code: i32) -> DocWireResult<Bson> {
    let mut out = Bson::new();
    out.append_string("errmsg", message)?;
    out.append_int("code", code)?;
    out.append_double("ok", 0.0)?;
    out.finish()?;
    Ok(out)
}

fn ok_with(build: impl FnOnce(&mut Bson) -> DocWireResult<()>) -> DocWireResult<Bson> {
    let mut out = Bson::new();
    build(&mut out)?;
    out.append_double("ok", 1.0)?;
    out.finish()?;
    Ok(out)
}

impl Session {
    pub(crate) fn run_command(&mut self, db: &str, cmd: RawDoc<'_>) -> DocWireResult<Bson> {
        let Some(first) = cmd.iter().next() else {
            return failure("empty command", 59);
        };
        let name = first.key();
        debug!("session {} command {} on {}", self.id, name, db);

        match name {
            "ismaster" | "isMaster" => self.is_master(),
            "ping" => ok_with(|_| Ok(())),
            "getlasterror" | "getLastError" => self.get_last_error(),
            "getpreverror" | "getPrevError" => self.get_prev_error(),
            "reseterror" | "resetError" => {
                self.last_error = Default::default();
                self.prev_error = None;
                ok_with(|_| Ok(()))
            }
            "count" => self.count(db, cmd),
            "drop" => self.drop_collection(db, first.as_str()),
            "dropDatabase" => {
                self.state.store.drop_database(db);
                info!("dropped database {}", db);
                ok_with(|out| Ok(out.append_string("dropped", db)?))
            }
            "create" => self.create(db, cmd),
            "filemd5" => self.file_md5(db, cmd),
            "getnonce" => {
                let nonce = format!("{:016x}", rand::random::<u64>());
                self.nonce = Some(nonce.clone());
                ok_with(|out| Ok(out.append_string("nonce", &nonce)?))
            }
            "authenticate" => self.authenticate(db, cmd),
            other => failure(&format!("no such cmd: {}", other), 59),
        }
    }

    fn is_master(&self) -> DocWireResult<Bson> {
        let config = self.state.config();
        ok_with(|out| {
            out.append_bool("ismaster", config.primary)?;
            out.append_bool("secondary", !config.primary)?;
            out.append_int("maxBsonObjectSize", config.max_bson_size)?;
            if let Some(set_name) = &config.set_name {
                out.append_string("setName", set_name)?;
            }
            if !config.hosts.is_empty() {
                out.begin_array("hosts")?;
                for (i, host) in config.hosts.iter().enumerate() {
                    out.append_string(i.to_string(), host)?;
                }
                out.finish_array()?;
            }
            Ok(())
        })
    }

    fn get_last_error(&self) -> DocWireResult<Bson> {
        let last = &self.last_error;
        ok_with(|out| {
            match &last.err {
                Some(err) => {
                    out.append_string("err", err)?;
                    out.append_int("code", last.code)?;
                }
                None => out.append_null("err")?,
            }
            out.append_int("n", last.n as i32)?;
            if let Some(existing) = last.updated_existing {
                out.append_bool("updatedExisting", existing)?;
            }
            if let Some(id) = &last.upserted {
                out.append_oid("upserted", id)?;
            }
            Ok(())
        })
    }

    fn get_prev_error(&self) -> DocWireResult<Bson> {
        let prev = self.prev_error.as_ref();
        ok_with(|out| {
            match prev.and_then(|p| p.err.as_ref()) {
                Some(err) => {
                    out.append_string("err", err)?;
                    out.append_int("nPrev", 1)?;
                }
                None => {
                    out.append_null("err")?;
                    out.append_int("nPrev", -1)?;
                }
            }
            Ok(())
        })
    }

    fn count(&self, db: &str, cmd: RawDoc<'_>) -> DocWireResult<Bson> {
        let ns = format!("{}.{}", db, cmd.find("count").map_or("", |e| e.as_str()));
        let filter = cmd
            .find("query")
            .filter(|e| e.kind() == BsonType::Object)
            .map_or_else(|| RawDoc::empty(), |e| e.as_document());
        match self.state.store.count(&ns, filter) {
            Ok(n) => ok_with(|out| Ok(out.append_double("n", n as f64)?)),
            Err(e) => failure(&e.to_string(), e.code()),
        }
    }

    fn drop_collection(&self, db: &str, collection: &str) -> DocWireResult<Bson> {
        let ns = format!("{}.{}", db, collection);
        match self.state.store.drop_collection(&ns) {
            Ok(indexes) => {
                info!("dropped {}", ns);
                ok_with(|out| {
                    out.append_string("ns", &ns)?;
                    out.append_int("nIndexesWas", indexes as i32)?;
                    Ok(())
                })
            }
            Err(e) => failure(&e.to_string(), e.code()),
        }
    }

    fn create(&self, db: &str, cmd: RawDoc<'_>) -> DocWireResult<Bson> {
        let ns = format!("{}.{}", db, cmd.find("create").map_or("", |e| e.as_str()));
        let capped = cmd
            .find("capped")
            .is_some_and(|e| e.as_bool())
            .then(|| CappedSpec {
                size: cmd.find("size").map_or(0, |e| e.as_i64().max(0) as usize),
                max: cmd.find("max").map_or(0, |e| e.as_i64().max(0) as usize),
            });
        match self.state.store.create_collection(&ns, capped) {
            Ok(()) => ok_with(|_| Ok(())),
            Err(e) => failure(&e.to_string(), e.code()),
        }
    }

    /// MD5 of a stored file's chunks concatenated in order.
    fn file_md5(&self, db: &str, cmd: RawDoc<'_>) -> DocWireResult<Bson> {
        let Some(id) = cmd.find("filemd5") else {
            return failure("filemd5 needs a file id", 2);
        };
        let root = cmd
            .find("root")
            .map(|e| e.as_str())
            .filter(|r| !r.is_empty())
            .unwrap_or("fs");

        let mut query = Bson::new();
        query.begin_object("$query")?;
        query.append_element(Some("files_id"), &id)?;
        query.finish_object()?;
        query.begin_object("$orderby")?;
        query.append_int("n", 1)?;
        query.finish_object()?;
        query.finish()?;

        let chunks = match self
            .state
            .store
            .find(&format!("{}.{}.chunks", db, root), query.view())
        {
            Ok(chunks) => chunks,
            Err(e) => return failure(&e.to_string(), e.code()),
        };
        let mut context = md5::Context::new();
        for chunk in &chunks {
            if let Some(data) = chunk.find("data") {
                context.consume(data.bin_data());
            }
        }
        let digest = format!("{:x}", context.compute());
        ok_with(|out| {
            out.append_int("numChunks", chunks.len() as i32)?;
            out.append_string("md5", &digest)?;
            Ok(())
        })
    }

    fn authenticate(&mut self, db: &str, cmd: RawDoc<'_>) -> DocWireResult<Bson> {
        let user = cmd.find("user").map_or("", |e| e.as_str());
        let nonce = cmd.find("nonce").map_or("", |e| e.as_str());
        let key = cmd.find("key").map_or("", |e| e.as_str());
        if self.nonce.as_deref() != Some(nonce) || nonce.is_empty() {
            return failure("auth fails", 18);
        }
        self.nonce = None;

        let mut selector = Bson::new();
        selector.append_string("user", user)?;
        selector.finish()?;
        let found = self
            .state
            .store
            .find(&format!("{}.system.users", db), selector.view())
            .unwrap_or_default();
        let Some(pwd) = found.first().and_then(|u| u.find("pwd")).map(|e| e.as_str().to_string())
        else {
            return failure("auth fails", 18);
        };

        let expected = format!("{:x}", md5::compute(format!("{}{}{}", nonce, user, pwd)));
        if expected != key {
            return failure("auth fails", 18);
        }
        info!("session {} authenticated {} on {}", self.id, user, db);
        self.authenticated.push((db.to_string(), user.to_string()));
        ok_with(|_| Ok(()))
    }
}
