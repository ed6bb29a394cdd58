//! Kernel notifications → synthetic bus messages.
//!
//! Peer and name lifecycle changes become `NameOwnerChanged` signals from
//! the bus service; failed method calls become `NoReply` errors addressed to
//! this connection.

use kdbus_wire::{format_unique_name, IdChange, Item, KmsgView, NameChange};

use crate::error::{BusError, BusResult};
use crate::message::{
    Message, Value, BUS_INTERFACE, BUS_PATH, BUS_SERVICE, ERROR_NO_REPLY, SYNTHETIC_SERIAL,
};

/// A kernel notification this layer translates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Notification<'a> {
    NameAdd(NameChange<'a>),
    NameRemove(NameChange<'a>),
    NameChange(NameChange<'a>),
    IdAdd(IdChange),
    IdRemove(IdChange),
    /// The call with serial `cookie` got no reply in time.
    ReplyTimeout { cookie: u64 },
    /// The peer handling the call with serial `cookie` went away.
    ReplyDead { cookie: u64 },
}

impl<'a> Notification<'a> {
    fn from_item(item: Item<'a>, cookie_reply: u64) -> Option<Self> {
        Some(match item {
            Item::NameAdd(change) => Notification::NameAdd(change),
            Item::NameRemove(change) => Notification::NameRemove(change),
            Item::NameChange(change) => Notification::NameChange(change),
            Item::IdAdd(change) => Notification::IdAdd(change),
            Item::IdRemove(change) => Notification::IdRemove(change),
            Item::ReplyTimeout => Notification::ReplyTimeout {
                cookie: cookie_reply,
            },
            Item::ReplyDead => Notification::ReplyDead {
                cookie: cookie_reply,
            },
            _ => return None,
        })
    }

    /// The notification in a kernel message, if any. More than one is
    /// malformed. Items are classified by tag; only the notification item
    /// itself is decoded.
    pub fn find(view: &KmsgView<'a>) -> BusResult<Option<Self>> {
        let mut found = None;
        for raw in view.items() {
            let raw = raw?;
            match raw.item_type() {
                Some(ty) if ty.is_kernel_notification() => {
                    if found.replace(raw).is_some() {
                        return Err(BusError::Malformed("more than one kernel notification"));
                    }
                }
                _ => log::debug!("ignoring item {:#x} in kernel message", raw.tag),
            }
        }
        let Some(raw) = found else {
            return Ok(None);
        };
        Ok(Self::from_item(raw.decode()?, view.header().timeout_or_reply))
    }

    /// Builds the sealed message this notification stands for; `None` for
    /// name changes that carry flags.
    pub fn synthesize(self, unique_name: &str) -> BusResult<Option<Message>> {
        let owner = format_unique_name;
        let (name, old, new) = match self {
            Notification::NameAdd(change)
            | Notification::NameRemove(change)
            | Notification::NameChange(change)
                if change.flags != 0 =>
            {
                return Ok(None)
            }
            Notification::NameAdd(change) => {
                (change.name.to_owned(), String::new(), owner(change.new_id))
            }
            Notification::NameRemove(change) => {
                (change.name.to_owned(), owner(change.old_id), String::new())
            }
            Notification::NameChange(change) => {
                (change.name.to_owned(), owner(change.old_id), owner(change.new_id))
            }
            Notification::IdAdd(change) => (owner(change.id), String::new(), owner(change.id)),
            Notification::IdRemove(change) => (owner(change.id), owner(change.id), String::new()),
            Notification::ReplyTimeout { cookie } => {
                return no_reply(cookie, "Method call timed out", unique_name).map(Some)
            }
            Notification::ReplyDead { cookie } => {
                return no_reply(cookie, "Method call peer died", unique_name).map(Some)
            }
        };
        name_owner_changed(&name, &old, &new).map(Some)
    }
}

/// Translates a kernel-payload message; `Ok(None)` when there is nothing to
/// deliver.
pub fn translate(view: &KmsgView<'_>, unique_name: &str) -> BusResult<Option<Message>> {
    match Notification::find(view)? {
        Some(notification) => notification.synthesize(unique_name),
        None => {
            log::debug!("kernel message without a notification to translate");
            Ok(None)
        }
    }
}

fn name_owner_changed(name: &str, old_owner: &str, new_owner: &str) -> BusResult<Message> {
    let mut msg = Message::signal(BUS_PATH, BUS_INTERFACE, "NameOwnerChanged");
    msg.append(Value::Str(name.to_owned()))?;
    msg.append(Value::Str(old_owner.to_owned()))?;
    msg.append(Value::Str(new_owner.to_owned()))?;
    msg.set_sender(Some(BUS_SERVICE))?;
    msg.seal(SYNTHETIC_SERIAL)?;
    Ok(msg)
}

fn no_reply(cookie: u64, text: &str, unique_name: &str) -> BusResult<Message> {
    let reply_serial =
        u32::try_from(cookie).map_err(|_| BusError::Malformed("reply cookie out of range"))?;
    let mut msg = Message::error(reply_serial, ERROR_NO_REPLY, text)?;
    msg.set_sender(Some(BUS_SERVICE))?;
    msg.set_destination(Some(unique_name))?;
    msg.seal(SYNTHETIC_SERIAL)?;
    Ok(msg)
}
