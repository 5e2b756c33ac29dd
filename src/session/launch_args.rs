use tracing::{debug, warn};

use crate::substrate::peer_identity::GroupId;

/// A process started with `+connect_lobby <group>` joins that group on startup. Peer directories
///  pass this string as the invitee's launch arguments.
pub const CONNECT_LOBBY_ARG: &str = "+connect_lobby";

/// The connect string for inviting peers into a group
pub fn connect_lobby_arg(group: GroupId) -> String {
    format!("{} {}", CONNECT_LOBBY_ARG, group)
}

/// Finds the group to join in a process' launch arguments. If there are several, the last one
///  wins; ids that do not parse are ignored.
pub fn connect_lobby_from_args<S: AsRef<str>>(args: &[S]) -> Option<GroupId> {
    let mut result = None;

    for (i, arg) in args.iter().enumerate() {
        if arg.as_ref() != CONNECT_LOBBY_ARG {
            continue;
        }

        match args.get(i + 1).map(|s| s.as_ref().parse::<GroupId>()) {
            Some(Ok(group)) => {
                debug!("launch arguments request joining {:?}", group);
                result = Some(group);
            }
            Some(Err(_)) => warn!("{} with unparsable group id {:?} - ignoring", CONNECT_LOBBY_ARG, args[i + 1].as_ref()),
            None => warn!("{} without group id - ignoring", CONNECT_LOBBY_ARG),
        }
    }

    result
}
