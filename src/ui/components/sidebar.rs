use crate::chat::ViewModel;

pub fn render(view: &ViewModel) -> String {
    if view.online_participants.is_empty() {
        return "Online: nobody else yet".to_string();
    }

    let names: Vec<String> = view
        .online_participants
        .iter()
        .map(|record| format!("● {} ({})", record.display_name, record.contact_id))
        .collect();
    format!("Online: {}", names.join(", "))
}
