/// The app's bottom tabs, in display order. Two embed a website
/// full-screen; `Community` hosts the chat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tab {
    Feedback,
    AphiaOne,
    Community,
}

pub const ALL_TABS: [Tab; 3] = [Tab::Feedback, Tab::AphiaOne, Tab::Community];

impl Tab {
    pub fn title(self) -> &'static str {
        match self {
            Tab::AphiaOne => "AphiaOne",
            Tab::Community => "Community",
            Tab::Feedback => "Feedback",
        }
    }

    /// Fixed address shown in an embedded browser view, if this is a web tab.
    pub fn embedded_url(self) -> Option<&'static str> {
        match self {
            Tab::AphiaOne => Some("https://aphiaone.machakos.go.ke/"),
            Tab::Feedback => Some("https://themusyawahotel.netlify.app/"),
            Tab::Community => None,
        }
    }
}
