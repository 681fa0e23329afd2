use crate::types::{Player, PlayerId, Role, Team};

/// Picks the acting director: a player holding the director role, otherwise
/// the first blue player, otherwise the first player, the last two as a
/// temporary director. Returns `(director, is_temporary)`.
pub fn elect_director(players: &[Player]) -> Option<(PlayerId, bool)> {
    if let Some(designated) = players.iter().find(|player| player.role == Role::Director) {
        return Some((designated.id.clone(), false));
    }
    players
        .iter()
        .find(|player| player.team == Team::Blue)
        .or_else(|| players.first())
        .map(|player| (player.id.clone(), true))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn player(id: &str, team: Team, role: Role) -> Player {
        Player {
            id: id.to_string(),
            display_name: id.to_uppercase(),
            team,
            role,
            ready: false,
            connected: true,
        }
    }

    #[test]
    fn designated_director_wins() {
        let players = vec![
            player("a", Team::Blue, Role::Participant),
            player("b", Team::Red, Role::Director),
        ];
        assert_eq!(elect_director(&players), Some(("b".to_string(), false)));
    }

    #[test]
    fn first_blue_player_becomes_temporary_director() {
        let players = vec![
            player("a", Team::Red, Role::Participant),
            player("b", Team::Blue, Role::Participant),
            player("c", Team::Blue, Role::Participant),
        ];
        assert_eq!(elect_director(&players), Some(("b".to_string(), true)));
    }

    #[test]
    fn falls_back_to_first_player() {
        let players = vec![
            player("a", Team::Red, Role::Participant),
            player("b", Team::None, Role::Participant),
        ];
        assert_eq!(elect_director(&players), Some(("a".to_string(), true)));
        assert_eq!(elect_director(&[]), None);
    }
}
