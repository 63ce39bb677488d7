use parley_db::members::MemberRow;
use parley_db::rooms::RoomRow;
use parley_db::DbPool;
use parley_models::room::MemberRole;

use crate::error::CoreError;

pub async fn load_room(pool: &DbPool, room_id: i64) -> Result<RoomRow, CoreError> {
    parley_db::rooms::get_room(pool, room_id)
        .await?
        .ok_or(CoreError::NotFound("room"))
}

/// The caller's membership row, or an authorization error.
pub async fn require_member(pool: &DbPool, room_id: i64, user_id: i64) -> Result<MemberRow, CoreError> {
    parley_db::members::get_member(pool, room_id, user_id)
        .await?
        .ok_or_else(|| CoreError::forbidden("not a member of this room"))
}

/// Check that `member` holds at least `min`.
pub fn require_role(member: &MemberRow, min: MemberRole, action: &str) -> Result<(), CoreError> {
    if member.role() < min {
        return Err(CoreError::forbidden(format!(
            "{} role required to {action}",
            min.as_str()
        )));
    }
    Ok(())
}

/// Roles a member may hand out through invites. Ownership never moves this way.
pub fn can_grant(actor: MemberRole, role: MemberRole) -> bool {
    role != MemberRole::Owner && role <= actor
}
