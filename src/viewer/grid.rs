use std::collections::BTreeSet;

/// Шаг сверки сетки с набором транслирующих студентов
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GridAction {
    Close(String),
    Open(String),
}

/// Сначала закрытия, потом открытия; внутри - по id пира.
/// Применение результата и повторный вызов дают пустой список.
pub fn diff(linked: &BTreeSet<String>, sharing: &BTreeSet<String>) -> Vec<GridAction> {
    let closes = linked.difference(sharing).cloned().map(GridAction::Close);
    let opens = sharing.difference(linked).cloned().map(GridAction::Open);
    closes.chain(opens).collect()
}

/// Применяет шаги к множеству (для проверок и предпросмотра)
pub fn apply(linked: &mut BTreeSet<String>, actions: &[GridAction]) {
    for action in actions {
        match action {
            GridAction::Close(peer) => {
                linked.remove(peer);
            }
            GridAction::Open(peer) => {
                linked.insert(peer.clone());
            }
        }
    }
}
